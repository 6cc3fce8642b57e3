//! Quantization and dequantization primitives
//!
//! Linear matrices are quantized row by row in fixed-size blocks:
//! - Int8: per-block min/max affine quantization to 256 levels
//! - NF4 / SF4: per-block absmax scaling onto a 16-entry codebook, two codes per byte

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Block size for Int8 min/max quantization
pub const INT8_BLOCK_SIZE: usize = 128;
/// Block size for 4-bit codebook quantization
pub const FP4_BLOCK_SIZE: usize = 64;

/// NormalFloat-4 codebook (quantiles of a standard normal, normalised to [-1, 1])
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// StudentFloat-4 codebook (quantiles of a Student-t with 5 degrees of freedom)
pub const SF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.627_780_7,
    -0.454_736_1,
    -0.334_330_8,
    -0.237_434_4,
    -0.152_898_7,
    -0.074_982_5,
    0.0,
    0.065_513_1,
    0.132_964_8,
    0.204_661_1,
    0.283_834_8,
    0.375_804_9,
    0.491_075_7,
    0.656_781_3,
    1.0,
];

/// Storage precision applied to the linear matrices of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quant {
    /// Keep full (or half) precision
    #[default]
    None,
    Int8,
    NF4,
    SF4,
}

impl Quant {
    /// Codebook used by the 4-bit formats
    pub fn codebook(&self) -> Option<&'static [f32; 16]> {
        match self {
            Quant::NF4 => Some(&NF4_CODEBOOK),
            Quant::SF4 => Some(&SF4_CODEBOOK),
            Quant::None | Quant::Int8 => None,
        }
    }
}

/// Number of blocks needed to cover `len` values
pub fn num_blocks(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size)
}

/// Int8-quantize one row; appends codes to `codes` and one (min, scale) pair per block.
pub fn quantize_int8_row(row: &[f32], codes: &mut Vec<u8>, mins: &mut Vec<f32>, scales: &mut Vec<f32>) {
    for block in row.chunks(INT8_BLOCK_SIZE) {
        let min = block.iter().copied().fold(f32::INFINITY, f32::min);
        let max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let scale = (max - min) / 255.0;
        mins.push(min);
        scales.push(scale);

        for &x in block {
            let q = if scale > 0.0 { ((x - min) / scale).round().clamp(0.0, 255.0) } else { 0.0 };
            codes.push(q as u8);
        }
    }
}

/// Dequantize one Int8 row produced by [`quantize_int8_row`].
pub fn dequantize_int8_row(codes: &[u8], mins: &[f32], scales: &[f32], output: &mut [f32]) -> Result<()> {
    if codes.len() != output.len() {
        return Err(Error::SizeMismatch { expected: output.len(), actual: codes.len() });
    }
    let blocks = num_blocks(output.len(), INT8_BLOCK_SIZE);
    if mins.len() != blocks || scales.len() != blocks {
        return Err(Error::SizeMismatch { expected: blocks, actual: mins.len().min(scales.len()) });
    }

    for (index, (code_block, out_block)) in
        codes.chunks(INT8_BLOCK_SIZE).zip(output.chunks_mut(INT8_BLOCK_SIZE)).enumerate()
    {
        let (min, scale) = (mins[index], scales[index]);
        for (out, &q) in out_block.iter_mut().zip(code_block) {
            *out = min + q as f32 * scale;
        }
    }
    Ok(())
}

/// Index of the codebook entry nearest to `x` (codebook is sorted ascending).
#[inline]
pub fn nearest_code(x: f32, codebook: &[f32; 16]) -> u8 {
    let upper = codebook.partition_point(|&c| c < x);
    if upper == 0 {
        return 0;
    }
    if upper == codebook.len() {
        return (codebook.len() - 1) as u8;
    }
    let lower = upper - 1;
    if x - codebook[lower] <= codebook[upper] - x {
        lower as u8
    } else {
        upper as u8
    }
}

/// 4-bit quantize one row; appends packed codes (low nibble first) and one absmax per block.
pub fn quantize_fp4_row(row: &[f32], codebook: &[f32; 16], codes: &mut Vec<u8>, absmax: &mut Vec<f32>) {
    let start = codes.len();
    let mut nibbles = Vec::with_capacity(row.len());
    for block in row.chunks(FP4_BLOCK_SIZE) {
        let amax = block.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
        absmax.push(amax);
        let inv = if amax > 0.0 { 1.0 / amax } else { 0.0 };
        nibbles.extend(block.iter().map(|&x| nearest_code(x * inv, codebook)));
    }

    codes.extend(nibbles.chunks(2).map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0) << 4)));
    debug_assert_eq!(codes.len() - start, row.len().div_ceil(2));
}

/// Dequantize one 4-bit row produced by [`quantize_fp4_row`].
pub fn dequantize_fp4_row(
    codes: &[u8],
    absmax: &[f32],
    codebook: &[f32; 16],
    output: &mut [f32],
) -> Result<()> {
    if codes.len() != output.len().div_ceil(2) {
        return Err(Error::SizeMismatch { expected: output.len().div_ceil(2), actual: codes.len() });
    }
    let blocks = num_blocks(output.len(), FP4_BLOCK_SIZE);
    if absmax.len() != blocks {
        return Err(Error::SizeMismatch { expected: blocks, actual: absmax.len() });
    }

    for (index, out) in output.iter_mut().enumerate() {
        let byte = codes[index / 2];
        let code = if index % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        *out = codebook[code as usize] * absmax[index / FP4_BLOCK_SIZE];
    }
    Ok(())
}
