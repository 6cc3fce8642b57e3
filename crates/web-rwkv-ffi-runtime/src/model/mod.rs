//! RWKV model: embedding, a stack of recurrent blocks, and the output head
//!
//! Each token runs `emb -> ln0 -> blocks -> ln_out -> head`. Blocks read and
//! update their own slice of the slot state, so a forward pass is a pure function
//! of `(weights, state, token)`.

pub mod hooks;
pub mod v4;
pub mod v5;
pub mod v6;
pub mod v7;
pub mod weights;

use crate::state::StateLayout;
use hooks::HookMap;
use std::sync::Arc;
use weights::WeightSource;
use web_rwkv_ffi_core::{Error, ModelInfo, ModelVersion, Result, Tensor};
use web_rwkv_ffi_cpu::kernels::{self, LAYER_NORM_EPS};
use web_rwkv_ffi_cpu::Matrix;

/// Values passed from block to block within one token
#[derive(Debug, Default)]
pub struct Carry {
    /// v7: value vector of the first block
    pub v_first: Option<Vec<f32>>,
}

/// One recurrent block
pub trait Layer: Send + Sync {
    /// Advance the residual stream `x` by one token, updating this block's `state`.
    fn forward(&self, x: &mut [f32], state: &mut [f32], carry: &mut Carry) -> Result<()>;
}

/// Affine layer norm
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl LayerNorm {
    /// Load `{prefix}.weight` and `{prefix}.bias`.
    pub fn load(source: &dyn WeightSource, prefix: &str, len: usize) -> Result<Self> {
        let weight = source.vector_of(&format!("{prefix}.weight"), len)?;
        let bias = source.vector_of(&format!("{prefix}.bias"), len)?;
        Ok(Self { weight, bias })
    }

    pub fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        let mut output = vec![0.0; x.len()];
        kernels::layer_norm(x, &self.weight, &self.bias, LAYER_NORM_EPS, &mut output)?;
        Ok(output)
    }

    /// Group norm over `groups` heads with this norm's affine parameters
    pub fn apply_groups(&self, x: &mut [f32], groups: usize) -> Result<()> {
        kernels::group_norm(x, groups, &self.weight, &self.bias, kernels::GROUP_NORM_EPS)
    }
}

/// A complete model ready for inference
pub struct Model {
    info: ModelInfo,
    rescale: Option<usize>,
    emb: Tensor,
    ln0: LayerNorm,
    layers: Vec<Box<dyn Layer>>,
    ln_out: LayerNorm,
    head: Matrix,
}

impl Model {
    /// Assemble a model from `source`.
    ///
    /// `rescale` must match how the source's output projections were scaled.
    pub fn build(source: &dyn WeightSource, rescale: Option<usize>, hooks: HookMap) -> Result<Self> {
        let info = source.info()?;
        let c = info.num_emb;

        let emb = source.tensor("emb.weight")?;
        if emb.shape.matrix()? != (info.num_vocab, c) {
            return Err(Error::ModelLoadFailure(format!(
                "`emb.weight` has shape {:?}, expected {}x{c}",
                emb.shape.dims(),
                info.num_vocab
            )));
        }
        let ln0 = LayerNorm::load(source, "blocks.0.ln0", c)?;
        let ln_out = LayerNorm::load(source, "ln_out", c)?;
        let head = source.matrix_of("head.weight", info.num_vocab, c)?;

        let hooks = Arc::new(hooks);
        let layers = (0..info.num_layer)
            .map(|layer| {
                let block: Box<dyn Layer> = match info.version {
                    ModelVersion::V4 => Box::new(v4::Block::load(source, &info, layer)?),
                    ModelVersion::V5 => Box::new(v5::Block::load(source, &info, layer)?),
                    ModelVersion::V6 => Box::new(v6::Block::load(source, &info, layer, hooks.clone())?),
                    ModelVersion::V7 => Box::new(v7::Block::load(source, &info, layer, hooks.clone())?),
                };
                Ok(block)
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!("built {} model with {} hooks", info.version, hooks.len());
        Ok(Self { info, rescale, emb, ln0, layers, ln_out, head })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn rescale(&self) -> Option<usize> {
        self.rescale
    }

    pub fn state_layout(&self) -> StateLayout {
        StateLayout::new(&self.info)
    }

    /// Check a token id against the vocabulary.
    pub fn check_token(&self, token: u32) -> Result<()> {
        if token as usize >= self.info.num_vocab {
            return Err(Error::IndexOutOfRange { index: token as usize, bound: self.info.num_vocab });
        }
        Ok(())
    }

    /// Feed one token through the network, returning logits when `logits` is set.
    pub fn forward(&self, token: u32, state: &mut [f32], logits: bool) -> Result<Option<Vec<f32>>> {
        self.check_token(token)?;
        let layout = self.state_layout();
        if state.len() != layout.len() {
            return Err(Error::SizeMismatch { expected: layout.len(), actual: state.len() });
        }

        let mut x = self.ln0.apply(self.emb.row(token as usize)?)?;
        let mut carry = Carry::default();
        for (index, (layer, state)) in
            self.layers.iter().zip(state.chunks_mut(layout.layer_len())).enumerate()
        {
            layer.forward(&mut x, state, &mut carry)?;
            if let Some(rescale) = self.rescale.filter(|&r| r > 0) {
                if (index + 1) % rescale == 0 {
                    x.iter_mut().for_each(|v| *v *= 0.5);
                }
            }
        }

        if !logits {
            return Ok(None);
        }
        let x = self.ln_out.apply(&x)?;
        Ok(Some(self.head.apply(&x)?))
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("info", &self.info).field("rescale", &self.rescale).finish()
    }
}

/// `output = a * b` element-wise
pub(crate) fn mul(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x * y).collect()
}

/// Low-rank projection `(x @ w1) @ w2` with both factors stored input-major
#[derive(Debug, Clone)]
pub(crate) struct LoRA {
    w1: Vec<f32>,
    w2: Vec<f32>,
    dim: usize,
    rank: usize,
}

impl LoRA {
    pub fn load(source: &dyn WeightSource, w1: &str, w2: &str, dim: usize) -> Result<Self> {
        let (rows, rank, w1) = source.dense(w1)?;
        let (rank2, cols, w2) = source.dense(w2)?;
        if rows != dim || cols != dim || rank != rank2 {
            return Err(Error::ModelLoadFailure(format!(
                "low-rank pair {rows}x{rank} / {rank2}x{cols} does not fit width {dim}"
            )));
        }
        Ok(Self { w1, w2, dim, rank })
    }

    /// `act(x @ w1) @ w2`
    pub fn apply(&self, x: &[f32], act: impl Fn(&mut [f32])) -> Result<Vec<f32>> {
        let mut hidden = vec![0.0; self.rank];
        web_rwkv_ffi_cpu::vecmat(x, &self.w1, self.dim, self.rank, &mut hidden)?;
        act(&mut hidden);
        let mut output = vec![0.0; self.dim];
        web_rwkv_ffi_cpu::vecmat(&hidden, &self.w2, self.rank, self.dim, &mut output)?;
        Ok(output)
    }
}

/// Per-head matrix-valued state update shared by v5 and v6.
///
/// For head `h` with key index `i` and value index `j`:
/// `out_j = sum_i r_i (u_i k_i v_j + s_ij)` then `s_ij = s_ij w_i + k_i v_j`.
pub(crate) fn wkv_heads(
    r: &[f32],
    k: &[f32],
    v: &[f32],
    w: &[f32],
    u: &[f32],
    kv: &mut [f32],
    head_size: usize,
) -> Vec<f32> {
    let mut out = vec![0.0; r.len()];
    for (h, s) in kv.chunks_mut(head_size * head_size).enumerate() {
        let base = h * head_size;
        for i in 0..head_size {
            let (ri, ki, wi, ui) = (r[base + i], k[base + i], w[base + i], u[base + i]);
            let row = &mut s[i * head_size..(i + 1) * head_size];
            for (j, sij) in row.iter_mut().enumerate() {
                let a = ki * v[base + j];
                out[base + j] += ri * (ui * a + *sij);
                *sij = a + wi * *sij;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wkv_heads_single_step() {
        // One head of size 2, empty state: out_j = sum_i r_i u_i k_i v_j
        let (r, k, v) = ([1.0, 2.0], [0.5, 1.0], [3.0, 4.0]);
        let (w, u) = ([0.9, 0.8], [1.0, 0.5]);
        let mut kv = vec![0.0; 4];
        let out = wkv_heads(&r, &k, &v, &w, &u, &mut kv, 2);

        let coef = 1.0 * 1.0 * 0.5 + 2.0 * 0.5 * 1.0;
        assert_eq!(out, vec![coef * 3.0, coef * 4.0]);
        assert_eq!(kv, vec![1.5, 2.0, 3.0, 4.0]);

        // Second step decays the state by w along the key axis
        let out = wkv_heads(&[1.0, 0.0], &[0.0, 0.0], &v, &w, &u, &mut kv, 2);
        assert_eq!(out, vec![1.5, 2.0]);
        assert!((kv[0] - 1.35).abs() < 1e-6);
        assert!((kv[2] - 2.4).abs() < 1e-6);
    }

    #[test]
    fn test_mul() {
        assert_eq!(mul(&[1.0, 2.0], &[3.0, 4.0]), vec![3.0, 8.0]);
    }
}
