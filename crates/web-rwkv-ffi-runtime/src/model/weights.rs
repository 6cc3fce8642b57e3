//! Weight sources the model is assembled from
//!
//! A raw checkpoint converts linear matrices on the fly (rescale, quantization,
//! half precision); a prefab stores them already converted. Both expose the same
//! [`WeightSource`] interface so the layer builders do not care which one they read.

use std::collections::BTreeMap;
use web_rwkv_ffi_core::{Error, Loader, ModelInfo, Quant, Result, Tensor};
use web_rwkv_ffi_cpu::Matrix;

/// Per-layer quantization of the linear matrices
pub type QuantMap = BTreeMap<usize, Quant>;

/// Build the layer quantization map: the first `quant` layers use Int8, the first
/// `quant_nf4` NF4 and the first `quant_sf4` SF4, later kinds taking precedence.
pub fn quant_map(quant: usize, quant_nf4: usize, quant_sf4: usize) -> QuantMap {
    (0..quant)
        .map(|layer| (layer, Quant::Int8))
        .chain((0..quant_nf4).map(|layer| (layer, Quant::NF4)))
        .chain((0..quant_sf4).map(|layer| (layer, Quant::SF4)))
        .collect()
}

/// Scale applied to the output projections of `layer` when the residual stream is
/// halved every `rescale` layers.
pub fn rescale_factor(layer: usize, rescale: Option<usize>) -> f32 {
    match rescale {
        Some(rescale) if rescale > 0 => 0.5f32.powi((layer / rescale) as i32),
        _ => 1.0,
    }
}

/// Where a linear matrix sits in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixPlan {
    /// Owning block; `None` for the head
    pub layer: Option<usize>,
    /// Output projection feeding the residual stream
    pub rescaled: bool,
}

/// Classify a tensor name as a linear matrix (the only tensors that are quantized).
pub fn matrix_plan(name: &str) -> Option<MatrixPlan> {
    if name == "head.weight" {
        return Some(MatrixPlan { layer: None, rescaled: false });
    }

    let rest = name.strip_prefix("blocks.")?;
    let (layer, rest) = rest.split_once('.')?;
    let layer = layer.parse().ok()?;
    let rescaled = match rest {
        "att.output.weight" | "ffn.value.weight" => true,
        "att.key.weight" | "att.value.weight" | "att.receptance.weight" | "att.gate.weight" => false,
        "ffn.key.weight" | "ffn.receptance.weight" => false,
        _ => return None,
    };
    Some(MatrixPlan { layer: Some(layer), rescaled })
}

/// Tensor provider used while building a model
pub trait WeightSource {
    fn info(&self) -> Result<ModelInfo>;

    fn contains(&self, name: &str) -> bool;

    /// Any floating point tensor, as f32
    fn tensor(&self, name: &str) -> Result<Tensor>;

    /// A linear matrix in its runtime storage
    fn matrix(&self, name: &str) -> Result<Matrix>;

    /// A linear matrix that must map `cols` inputs to `rows` outputs
    fn matrix_of(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix> {
        let matrix = self.matrix(name)?;
        if matrix.rows() != rows || matrix.cols() != cols {
            return Err(Error::ModelLoadFailure(format!(
                "`{name}` is {}x{}, expected {rows}x{cols}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        Ok(matrix)
    }

    /// A tensor flattened to a vector (mixing coefficients are stored as `[1, 1, C]`)
    fn vector(&self, name: &str) -> Result<Vec<f32>> {
        Ok(self.tensor(name)?.data)
    }

    /// A vector that must hold exactly `len` values
    fn vector_of(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        let data = self.vector(name)?;
        if data.len() != len {
            return Err(Error::ModelLoadFailure(format!(
                "`{name}` has {} values, expected {len}",
                data.len()
            )));
        }
        Ok(data)
    }

    /// A dense matrix kept in f32, e.g. the low-rank adapters
    fn dense(&self, name: &str) -> Result<(usize, usize, Vec<f32>)> {
        let tensor = self.tensor(name)?;
        let (rows, cols) = tensor.shape.matrix()?;
        Ok((rows, cols, tensor.data))
    }
}

/// Raw checkpoint with load-time conversion options
pub struct Checkpoint {
    loader: Loader,
    quant: QuantMap,
    rescale: Option<usize>,
    fp16: bool,
}

impl Checkpoint {
    pub fn new(loader: Loader, quant: QuantMap, rescale: Option<usize>, fp16: bool) -> Self {
        Self { loader, quant, rescale, fp16 }
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }
}

impl WeightSource for Checkpoint {
    fn info(&self) -> Result<ModelInfo> {
        self.loader.info_from_layout()
    }

    fn contains(&self, name: &str) -> bool {
        self.loader.contains(name)
    }

    fn tensor(&self, name: &str) -> Result<Tensor> {
        self.loader.tensor(name)
    }

    fn matrix(&self, name: &str) -> Result<Matrix> {
        let plan = matrix_plan(name)
            .ok_or_else(|| Error::InvalidArgument(format!("`{name}` is not a linear matrix")))?;

        let mut tensor = self.loader.tensor(name)?;
        let (rows, cols) = tensor.shape.matrix()?;
        if let (true, Some(layer)) = (plan.rescaled, plan.layer) {
            tensor.scale(rescale_factor(layer, self.rescale));
        }

        let quant = plan.layer.and_then(|layer| self.quant.get(&layer)).copied().unwrap_or_default();
        Matrix::quantize(rows, cols, tensor.data, quant, self.fp16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quant_map_precedence() {
        let map = quant_map(3, 2, 1);
        assert_eq!(map.get(&0), Some(&Quant::SF4));
        assert_eq!(map.get(&1), Some(&Quant::NF4));
        assert_eq!(map.get(&2), Some(&Quant::Int8));
        assert_eq!(map.get(&3), None);
        assert!(quant_map(0, 0, 0).is_empty());
    }

    #[test]
    fn test_matrix_plan() {
        assert_eq!(
            matrix_plan("blocks.12.att.output.weight"),
            Some(MatrixPlan { layer: Some(12), rescaled: true })
        );
        assert_eq!(
            matrix_plan("blocks.0.ffn.key.weight"),
            Some(MatrixPlan { layer: Some(0), rescaled: false })
        );
        assert_eq!(matrix_plan("head.weight"), Some(MatrixPlan { layer: None, rescaled: false }));
        assert_eq!(matrix_plan("blocks.0.att.time_maa_w1"), None);
        assert_eq!(matrix_plan("blocks.0.ln1.weight"), None);
        assert_eq!(matrix_plan("emb.weight"), None);
    }

    #[test]
    fn test_rescale_factor() {
        assert_eq!(rescale_factor(5, None), 1.0);
        assert_eq!(rescale_factor(5, Some(0)), 1.0);
        assert_eq!(rescale_factor(1, Some(2)), 1.0);
        assert_eq!(rescale_factor(2, Some(2)), 0.5);
        assert_eq!(rescale_factor(5, Some(2)), 0.25);
    }
}
