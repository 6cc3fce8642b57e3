use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Element type of a checkpoint tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    BF16,
    /// Raw bytes, used for packed quantized blocks
    U8,
}

impl DataType {
    /// Size in bytes per element
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::U8 => 1,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DataType {
    type Error = Error;

    fn try_from(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DataType::F32),
            safetensors::Dtype::F16 => Ok(DataType::F16),
            safetensors::Dtype::BF16 => Ok(DataType::BF16),
            safetensors::Dtype::U8 => Ok(DataType::U8),
            other => Err(Error::UnsupportedDataType(format!("{other:?}"))),
        }
    }
}

impl From<DataType> for safetensors::Dtype {
    fn from(dtype: DataType) -> Self {
        match dtype {
            DataType::F32 => safetensors::Dtype::F32,
            DataType::F16 => safetensors::Dtype::F16,
            DataType::BF16 => safetensors::Dtype::BF16,
            DataType::U8 => safetensors::Dtype::U8,
        }
    }
}

/// Tensor shape (dimensions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Dimensions with the leading unit axes removed, e.g. `[1, 1, 768]` -> `[768]`.
    ///
    /// PyTorch exports mixing vectors as `[1, 1, C]`; the runtime only cares
    /// about the trailing axes.
    pub fn squeezed(&self) -> Shape {
        let start = self.0.iter().position(|&d| d != 1).unwrap_or(self.0.len().saturating_sub(1));
        Shape(self.0[start..].to_vec())
    }

    /// Interpret as a `[rows, cols]` matrix after squeezing.
    pub fn matrix(&self) -> Result<(usize, usize)> {
        match self.squeezed().dims() {
            [rows, cols] => Ok((*rows, *cols)),
            dims => Err(Error::InvalidShape(format!("expected a matrix, got {dims:?}"))),
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

/// Dense f32 tensor owned by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if shape.numel() != data.len() {
            return Err(Error::SizeMismatch { expected: shape.numel(), actual: data.len() });
        }
        Ok(Self { shape, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow row `index` of a 2-D tensor.
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        let (rows, cols) = self.shape.matrix()?;
        if index >= rows {
            return Err(Error::IndexOutOfRange { index, bound: rows });
        }
        Ok(&self.data[index * cols..(index + 1) * cols])
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|x| *x *= factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_size_check() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert_eq!(shape.numel(), 24);
        assert!(Tensor::new(shape.clone(), vec![0.0; 24]).is_ok());
        assert!(matches!(Tensor::new(shape, vec![0.0; 23]), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_squeeze() {
        assert_eq!(Shape::new(vec![1, 1, 768]).squeezed(), Shape::new(vec![768]));
        assert_eq!(Shape::new(vec![12, 64]).squeezed(), Shape::new(vec![12, 64]));
        assert_eq!(Shape::new(vec![1, 1]).squeezed(), Shape::new(vec![1]));
        assert_eq!(Shape::new(vec![1, 4, 8]).matrix().unwrap(), (4, 8));
        assert!(Shape::new(vec![2, 4, 8]).matrix().is_err());
    }

    #[test]
    fn test_dtype_size() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::F16.size(), 2);
        assert_eq!(DataType::BF16.size(), 2);
        assert_eq!(DataType::U8.size(), 1);
        assert!(DataType::try_from(safetensors::Dtype::I64).is_err());
    }

    #[test]
    fn test_tensor_rows() {
        let tensor = Tensor::new(Shape::new(vec![2, 3]), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(tensor.row(1).unwrap(), &[3.0, 4.0, 5.0]);
        assert!(matches!(tensor.row(2), Err(Error::IndexOutOfRange { index: 2, bound: 2 })));
        assert!(Tensor::new(Shape::new(vec![2, 2]), vec![0.0; 3]).is_err());
    }
}
