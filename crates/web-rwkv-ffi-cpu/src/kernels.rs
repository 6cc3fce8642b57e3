//! Element-wise and normalisation kernels used by the RWKV blocks

use web_rwkv_ffi_core::error::{Error, Result};

/// Epsilon of the per-block layer norms
pub const LAYER_NORM_EPS: f32 = 1e-5;
/// Epsilon of the per-head group norm (`ln_x`) in v5+ blocks
pub const GROUP_NORM_EPS: f32 = 64e-5;

fn check_len(name: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::InvalidShape(format!("{name}: expected {expected} elements, got {actual}")));
    }
    Ok(())
}

/// Layer normalization: `output = (input - mean) / sqrt(var + eps) * weight + bias`
pub fn layer_norm(input: &[f32], weight: &[f32], bias: &[f32], eps: f32, output: &mut [f32]) -> Result<()> {
    check_len("layer_norm weight", input.len(), weight.len())?;
    check_len("layer_norm bias", input.len(), bias.len())?;
    check_len("layer_norm output", input.len(), output.len())?;

    let n = input.len() as f32;
    let mean = input.iter().sum::<f32>() / n;
    let variance = input.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
    let inv_std = 1.0 / (variance + eps).sqrt();

    for (i, out) in output.iter_mut().enumerate() {
        *out = (input[i] - mean) * inv_std * weight[i] + bias[i];
    }
    Ok(())
}

/// Group normalization in place: each of `groups` contiguous chunks is normalised
/// independently, then the affine `weight`/`bias` of the full vector is applied.
pub fn group_norm(x: &mut [f32], groups: usize, weight: &[f32], bias: &[f32], eps: f32) -> Result<()> {
    check_len("group_norm weight", x.len(), weight.len())?;
    check_len("group_norm bias", x.len(), bias.len())?;
    if groups == 0 || x.len() % groups != 0 {
        return Err(Error::InvalidShape(format!("{} channels cannot form {groups} groups", x.len())));
    }

    let size = x.len() / groups;
    for (g, chunk) in x.chunks_mut(size).enumerate() {
        let n = size as f32;
        let mean = chunk.iter().sum::<f32>() / n;
        let variance = chunk.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / n;
        let inv_std = 1.0 / (variance + eps).sqrt();
        for (i, v) in chunk.iter_mut().enumerate() {
            let c = g * size + i;
            *v = (*v - mean) * inv_std * weight[c] + bias[c];
        }
    }
    Ok(())
}

/// L2-normalise each of `groups` contiguous chunks in place.
pub fn l2_normalize(x: &mut [f32], groups: usize) -> Result<()> {
    if groups == 0 || x.len() % groups != 0 {
        return Err(Error::InvalidShape(format!("{} channels cannot form {groups} groups", x.len())));
    }
    let size = x.len() / groups;
    for chunk in x.chunks_mut(size) {
        let norm = chunk.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
        chunk.iter_mut().for_each(|v| *v /= norm);
    }
    Ok(())
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

pub fn sigmoid_inplace(x: &mut [f32]) {
    x.iter_mut().for_each(|v| *v = sigmoid(*v));
}

pub fn silu_inplace(x: &mut [f32]) {
    x.iter_mut().for_each(|v| *v = silu(*v));
}

pub fn tanh_inplace(x: &mut [f32]) {
    x.iter_mut().for_each(|v| *v = v.tanh());
}

/// Squared ReLU used by the channel-mix key: `max(x, 0)^2`
pub fn relu_squared_inplace(x: &mut [f32]) {
    x.iter_mut().for_each(|v| {
        let r = v.max(0.0);
        *v = r * r;
    });
}

/// Token shift mix: `output = x * mix + prev * (1 - mix)`
pub fn token_mix(x: &[f32], prev: &[f32], mix: &[f32], output: &mut [f32]) {
    for (i, out) in output.iter_mut().enumerate() {
        *out = x[i] * mix[i] + prev[i] * (1.0 - mix[i]);
    }
}

/// Token shift lerp (v6/v7 form): `output = x + (prev - x) * mix`
pub fn token_lerp(x: &[f32], prev: &[f32], mix: &[f32], output: &mut [f32]) {
    for (i, out) in output.iter_mut().enumerate() {
        *out = x[i] + (prev[i] - x[i]) * mix[i];
    }
}

/// Numerically stable softmax
pub fn softmax(input: &[f32]) -> Vec<f32> {
    let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut output: Vec<f32> = input.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = output.iter().sum();
    if sum > 0.0 {
        output.iter_mut().for_each(|v| *v /= sum);
    }
    output
}

pub fn add_assign(x: &mut [f32], y: &[f32]) {
    x.iter_mut().zip(y).for_each(|(a, b)| *a += b);
}
