/// Linear layer storage and matrix-vector products
///
/// Weights are kept row-major as `[out, in]` (PyTorch `nn.Linear` layout), so a
/// forward pass is one dot product per output row. Rows are independent and are
/// spread over the rayon pool.
use half::f16;
use rayon::prelude::*;
use web_rwkv_ffi_core::error::{Error, Result};
use web_rwkv_ffi_core::quant::{self, num_blocks, Quant, FP4_BLOCK_SIZE, INT8_BLOCK_SIZE};

/// Rows below this many multiply-adds are computed on the calling thread.
const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Element storage of a [`Matrix`]
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    /// One `(min, scale)` pair per 128-wide block of each row
    Int8 { codes: Vec<u8>, mins: Vec<f32>, scales: Vec<f32> },
    /// Two codes per byte, one absmax per 64-wide block of each row
    Fp4 { quant: Quant, codes: Vec<u8>, absmax: Vec<f32> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    storage: Storage,
}

impl Matrix {
    /// Wrap dense f32 data of shape `[rows, cols]`.
    pub fn from_f32(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidShape(format!(
                "matrix size mismatch: expected {}x{}={}, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, storage: Storage::F32(data) })
    }

    /// Build a matrix from dense data, converting it to the requested storage.
    ///
    /// `fp16` only applies when `quant` is [`Quant::None`].
    pub fn quantize(rows: usize, cols: usize, data: Vec<f32>, quant: Quant, fp16: bool) -> Result<Self> {
        if quant == Quant::None && !fp16 {
            return Self::from_f32(rows, cols, data);
        }
        if data.len() != rows * cols || cols == 0 {
            return Err(Error::InvalidShape(format!("cannot quantize {} values as {rows}x{cols}", data.len())));
        }

        let storage = match quant {
            Quant::None => Storage::F16(data.iter().map(|&x| f16::from_f32(x)).collect()),
            Quant::Int8 => {
                let blocks = rows * num_blocks(cols, INT8_BLOCK_SIZE);
                let mut codes = Vec::with_capacity(rows * cols);
                let (mut mins, mut scales) = (Vec::with_capacity(blocks), Vec::with_capacity(blocks));
                for row in data.chunks(cols) {
                    quant::quantize_int8_row(row, &mut codes, &mut mins, &mut scales);
                }
                Storage::Int8 { codes, mins, scales }
            }
            Quant::NF4 | Quant::SF4 => {
                let codebook = fp4_codebook(quant)?;
                let mut codes = Vec::with_capacity(rows * cols.div_ceil(2));
                let mut absmax = Vec::with_capacity(rows * num_blocks(cols, FP4_BLOCK_SIZE));
                for row in data.chunks(cols) {
                    quant::quantize_fp4_row(row, codebook, &mut codes, &mut absmax);
                }
                Storage::Fp4 { quant, codes, absmax }
            }
        };
        Ok(Self { rows, cols, storage })
    }

    /// Reassemble a matrix from previously exported storage, validating every buffer length.
    pub fn from_storage(rows: usize, cols: usize, storage: Storage) -> Result<Self> {
        let check = |name: &str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(Error::InvalidShape(format!("{name}: expected {expected} elements, got {actual}")))
            }
        };
        if cols == 0 && !matches!(storage, Storage::F32(_) | Storage::F16(_)) {
            return Err(Error::InvalidShape("quantized matrix must have at least one column".into()));
        }
        match &storage {
            Storage::F32(data) => check("f32 data", rows * cols, data.len())?,
            Storage::F16(data) => check("f16 data", rows * cols, data.len())?,
            Storage::Int8 { codes, mins, scales } => {
                let blocks = rows * num_blocks(cols, INT8_BLOCK_SIZE);
                check("int8 codes", rows * cols, codes.len())?;
                check("int8 mins", blocks, mins.len())?;
                check("int8 scales", blocks, scales.len())?;
            }
            Storage::Fp4 { quant, codes, absmax } => {
                fp4_codebook(*quant)?;
                check("fp4 codes", rows * cols.div_ceil(2), codes.len())?;
                check("fp4 absmax", rows * num_blocks(cols, FP4_BLOCK_SIZE), absmax.len())?;
            }
        }
        Ok(Self { rows, cols, storage })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Quantization kind of the stored elements
    pub fn quant(&self) -> Quant {
        match &self.storage {
            Storage::F32(_) | Storage::F16(_) => Quant::None,
            Storage::Int8 { .. } => Quant::Int8,
            Storage::Fp4 { quant, .. } => *quant,
        }
    }

    /// `output = W x`
    pub fn matvec(&self, x: &[f32], output: &mut [f32]) -> Result<()> {
        if x.len() != self.cols {
            return Err(Error::InvalidShape(format!(
                "matvec input: expected {}, got {}",
                self.cols,
                x.len()
            )));
        }
        if output.len() != self.rows {
            return Err(Error::InvalidShape(format!(
                "matvec output: expected {}, got {}",
                self.rows,
                output.len()
            )));
        }

        if self.rows * self.cols < PARALLEL_THRESHOLD {
            output.iter_mut().enumerate().for_each(|(row, out)| *out = self.dot_row(row, x));
        } else {
            output.par_iter_mut().enumerate().for_each(|(row, out)| *out = self.dot_row(row, x));
        }
        Ok(())
    }

    /// Allocating variant of [`Matrix::matvec`]
    pub fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut output = vec![0.0; self.rows];
        self.matvec(x, &mut output)?;
        Ok(output)
    }

    /// Expand back to dense f32 values.
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        let (rows, cols) = (self.rows, self.cols);
        match &self.storage {
            Storage::F32(data) => Ok(data.clone()),
            Storage::F16(data) => Ok(data.iter().map(|x| x.to_f32()).collect()),
            Storage::Int8 { codes, mins, scales } => {
                let blocks = num_blocks(cols, INT8_BLOCK_SIZE);
                let mut output = vec![0.0; rows * cols];
                for (row, out) in output.chunks_mut(cols).enumerate() {
                    let range = row * blocks..(row + 1) * blocks;
                    quant::dequantize_int8_row(
                        &codes[row * cols..(row + 1) * cols],
                        &mins[range.clone()],
                        &scales[range],
                        out,
                    )?;
                }
                Ok(output)
            }
            Storage::Fp4 { quant, codes, absmax } => {
                let codebook = fp4_codebook(*quant)?;
                let (stride, blocks) = (cols.div_ceil(2), num_blocks(cols, FP4_BLOCK_SIZE));
                let mut output = vec![0.0; rows * cols];
                for (row, out) in output.chunks_mut(cols).enumerate() {
                    quant::dequantize_fp4_row(
                        &codes[row * stride..(row + 1) * stride],
                        &absmax[row * blocks..(row + 1) * blocks],
                        codebook,
                        out,
                    )?;
                }
                Ok(output)
            }
        }
    }

    fn dot_row(&self, row: usize, x: &[f32]) -> f32 {
        let cols = self.cols;
        match &self.storage {
            Storage::F32(data) => {
                data[row * cols..(row + 1) * cols].iter().zip(x).map(|(w, x)| w * x).sum()
            }
            Storage::F16(data) => {
                data[row * cols..(row + 1) * cols].iter().zip(x).map(|(w, x)| w.to_f32() * x).sum()
            }
            Storage::Int8 { codes, mins, scales } => {
                let blocks = num_blocks(cols, INT8_BLOCK_SIZE);
                let codes = &codes[row * cols..(row + 1) * cols];
                codes
                    .chunks(INT8_BLOCK_SIZE)
                    .zip(x.chunks(INT8_BLOCK_SIZE))
                    .enumerate()
                    .map(|(block, (q, x))| {
                        let index = row * blocks + block;
                        let sum_x: f32 = x.iter().sum();
                        let sum_qx: f32 = q.iter().zip(x).map(|(&q, x)| q as f32 * x).sum();
                        mins[index] * sum_x + scales[index] * sum_qx
                    })
                    .sum()
            }
            Storage::Fp4 { quant, codes, absmax } => {
                let Some(codebook) = quant.codebook() else { return 0.0 };
                let stride = cols.div_ceil(2);
                let blocks = num_blocks(cols, FP4_BLOCK_SIZE);
                let codes = &codes[row * stride..(row + 1) * stride];

                let mut sums = vec![0.0f32; blocks];
                for (col, &x) in x.iter().enumerate() {
                    let byte = codes[col / 2];
                    let code = if col % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                    sums[col / FP4_BLOCK_SIZE] += codebook[code as usize] * x;
                }
                sums.iter().zip(&absmax[row * blocks..(row + 1) * blocks]).map(|(s, a)| s * a).sum()
            }
        }
    }
}

fn fp4_codebook(quant: Quant) -> Result<&'static [f32; 16]> {
    quant
        .codebook()
        .ok_or_else(|| Error::InvalidArgument(format!("{quant:?} is not a 4-bit quantization")))
}

/// `output = x W` for a weight stored as `[rows, cols]` with `x` of length `rows`.
///
/// Used for the low-rank adapters, which are exported input-major.
pub fn vecmat(x: &[f32], w: &[f32], rows: usize, cols: usize, output: &mut [f32]) -> Result<()> {
    if x.len() != rows || w.len() != rows * cols || output.len() != cols {
        return Err(Error::InvalidShape(format!(
            "vecmat: x {} / w {} / out {} do not fit {rows}x{cols}",
            x.len(),
            w.len(),
            output.len()
        )));
    }

    output.fill(0.0);
    for (xi, row) in x.iter().zip(w.chunks(cols)) {
        for (out, wij) in output.iter_mut().zip(row) {
            *out += xi * wij;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols).map(|i| ((i as f32) * 0.61).cos() * 0.5).collect()
    }

    fn reference(w: &[f32], x: &[f32], cols: usize) -> Vec<f32> {
        w.chunks(cols).map(|row| row.iter().zip(x).map(|(a, b)| a * b).sum()).collect()
    }

    #[test]
    fn test_matvec_f32() {
        let m = Matrix::from_f32(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.apply(&[1.0, 0.0, -1.0]).unwrap(), vec![-2.0, -2.0]);
        assert!(m.apply(&[1.0, 0.0]).is_err());
        assert!(Matrix::from_f32(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_quantized_matvec_close_to_dense() {
        let (rows, cols) = (8, 200);
        let w = sample(rows, cols);
        let x: Vec<f32> = (0..cols).map(|i| ((i as f32) * 0.13).sin()).collect();
        let expected = reference(&w, &x, cols);

        for (quant, fp16, tolerance) in [
            (Quant::None, true, 1e-2),
            (Quant::Int8, false, 1e-1),
            (Quant::NF4, false, 1.5),
            (Quant::SF4, false, 1.5),
        ] {
            let m = Matrix::quantize(rows, cols, w.clone(), quant, fp16).unwrap();
            assert_eq!(m.quant(), quant);
            let output = m.apply(&x).unwrap();
            for (a, b) in output.iter().zip(&expected) {
                assert!((a - b).abs() < tolerance, "{quant:?}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_parallel_path_matches_serial() {
        let (rows, cols) = (256, 128);
        let w = sample(rows, cols);
        let x = vec![0.5; cols];
        let m = Matrix::from_f32(rows, cols, w.clone()).unwrap();
        let output = m.apply(&x).unwrap();
        for (a, b) in output.iter().zip(reference(&w, &x, cols)) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_from_storage_validates() {
        let m = Matrix::quantize(3, 65, sample(3, 65), Quant::NF4, false).unwrap();
        let rebuilt = Matrix::from_storage(3, 65, m.storage().clone()).unwrap();
        assert_eq!(rebuilt, m);
        assert!(Matrix::from_storage(3, 64, m.storage().clone()).is_err());

        let storage = Storage::Fp4 { quant: Quant::Int8, codes: vec![0; 99], absmax: vec![0.0; 6] };
        assert!(Matrix::from_storage(3, 65, storage).is_err());
    }

    #[test]
    fn test_to_f32_int8() {
        let w = sample(2, 10);
        let m = Matrix::quantize(2, 10, w.clone(), Quant::Int8, false).unwrap();
        for (a, b) in m.to_f32().unwrap().iter().zip(&w) {
            assert!((a - b).abs() < 5e-3);
        }
    }

    #[test]
    fn test_vecmat() {
        // [[1, 2], [3, 4], [5, 6]]
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut output = [0.0; 2];
        vecmat(&[1.0, 1.0, 1.0], &w, 3, 2, &mut output).unwrap();
        assert_eq!(output, [9.0, 12.0]);
        assert!(vecmat(&[1.0], &w, 3, 2, &mut output).is_err());
    }
}
