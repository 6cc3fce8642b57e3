//! RWKV v6 block
//!
//! Adds data-dependent token shift (ddlerp) and a data-dependent decay, both
//! produced by low-rank adapters on top of the v5 matrix state.

use super::hooks::{Frame, Hook, HookMap};
use super::v4::ChannelMix;
use super::weights::WeightSource;
use super::{mul, wkv_heads, Carry, Layer, LayerNorm, LoRA};
use std::sync::Arc;
use web_rwkv_ffi_core::{Error, ModelInfo, Result};
use web_rwkv_ffi_cpu::kernels;
use web_rwkv_ffi_cpu::{vecmat, Matrix};

/// Order of the five interpolation targets in `time_maa_w1` / `time_maa_w2`
const MIX_TARGETS: usize = 5;

struct TimeMix {
    maa_x: Vec<f32>,
    /// `maa_w, maa_k, maa_v, maa_r, maa_g`
    maa: [Vec<f32>; MIX_TARGETS],
    /// `[C, 5 * rank]`
    maa_w1: Vec<f32>,
    /// `[5, rank, C]`
    maa_w2: Vec<f32>,
    maa_rank: usize,
    time_decay: Vec<f32>,
    decay_lora: LoRA,
    first: Vec<f32>,
    key: Matrix,
    value: Matrix,
    receptance: Matrix,
    gate: Matrix,
    output: Matrix,
    ln_x: LayerNorm,
}

pub struct Block {
    layer: usize,
    ln1: LayerNorm,
    ln2: LayerNorm,
    att: TimeMix,
    ffn: ChannelMix,
    hooks: Arc<HookMap>,
    num_emb: usize,
    num_head: usize,
}

impl Block {
    pub fn load(source: &dyn WeightSource, info: &ModelInfo, layer: usize, hooks: Arc<HookMap>) -> Result<Self> {
        let c = info.num_emb;
        let att = format!("blocks.{layer}.att");

        let (rows, cols, maa_w1) = source.dense(&format!("{att}.time_maa_w1"))?;
        if rows != c || cols % MIX_TARGETS != 0 {
            return Err(Error::ModelLoadFailure(format!("`{att}.time_maa_w1` is {rows}x{cols}")));
        }
        let maa_rank = cols / MIX_TARGETS;
        let maa_w2 = source.vector_of(&format!("{att}.time_maa_w2"), MIX_TARGETS * maa_rank * c)?;

        let maa = ["w", "k", "v", "r", "g"]
            .map(|target| source.vector_of(&format!("{att}.time_maa_{target}"), c));
        let [w, k, v, r, g] = maa;

        let att = TimeMix {
            maa_x: source.vector_of(&format!("{att}.time_maa_x"), c)?,
            maa: [w?, k?, v?, r?, g?],
            maa_w1,
            maa_w2,
            maa_rank,
            time_decay: source.vector_of(&format!("{att}.time_decay"), c)?,
            decay_lora: LoRA::load(
                source,
                &format!("{att}.time_decay_w1"),
                &format!("{att}.time_decay_w2"),
                c,
            )?,
            first: source.vector_of(&format!("{att}.time_faaaa"), c)?,
            key: source.matrix_of(&format!("{att}.key.weight"), c, c)?,
            value: source.matrix_of(&format!("{att}.value.weight"), c, c)?,
            receptance: source.matrix_of(&format!("{att}.receptance.weight"), c, c)?,
            gate: source.matrix_of(&format!("{att}.gate.weight"), c, c)?,
            output: source.matrix_of(&format!("{att}.output.weight"), c, c)?,
            ln_x: LayerNorm::load(source, &format!("{att}.ln_x"), c)?,
        };

        let ffn = format!("blocks.{layer}.ffn");
        Ok(Self {
            layer,
            ln1: LayerNorm::load(source, &format!("blocks.{layer}.ln1"), c)?,
            ln2: LayerNorm::load(source, &format!("blocks.{layer}.ln2"), c)?,
            att,
            ffn: ChannelMix::load_with(source, &ffn, (c, info.num_hidden), "time_maa_k", "time_maa_r", true)?,
            hooks,
            num_emb: c,
            num_head: info.num_head,
        })
    }

    /// Data-dependent interpolation between `x` and `prev` for the five targets.
    fn ddlerp(&self, x: &[f32], prev: &[f32]) -> Result<[Vec<f32>; MIX_TARGETS]> {
        let (c, rank) = (self.num_emb, self.att.maa_rank);
        let att = &self.att;

        let xx: Vec<f32> = prev.iter().zip(x).map(|(p, x)| p - x).collect();
        let xxx: Vec<f32> = x.iter().zip(&xx).zip(&att.maa_x).map(|((x, d), m)| x + d * m).collect();

        let mut hidden = vec![0.0; MIX_TARGETS * rank];
        vecmat(&xxx, &att.maa_w1, c, MIX_TARGETS * rank, &mut hidden)?;
        kernels::tanh_inplace(&mut hidden);

        let mut outputs: [Vec<f32>; MIX_TARGETS] = Default::default();
        for (index, output) in outputs.iter_mut().enumerate() {
            let mut delta = vec![0.0; c];
            let w2 = &att.maa_w2[index * rank * c..(index + 1) * rank * c];
            vecmat(&hidden[index * rank..(index + 1) * rank], w2, rank, c, &mut delta)?;
            *output = (0..c).map(|i| x[i] + xx[i] * (att.maa[index][i] + delta[i])).collect();
        }
        Ok(outputs)
    }

    fn time_mix(&self, x: &[f32], prev: &mut [f32], kv: &mut [f32]) -> Result<Vec<f32>> {
        let att = &self.att;
        let [xw, xk, xv, xr, xg] = self.ddlerp(x, prev)?;
        prev.copy_from_slice(x);

        let r = att.receptance.apply(&xr)?;
        let k = att.key.apply(&xk)?;
        let v = att.value.apply(&xv)?;
        let mut g = att.gate.apply(&xg)?;
        kernels::silu_inplace(&mut g);

        let delta = att.decay_lora.apply(&xw, kernels::tanh_inplace)?;
        let time_decay = att.time_decay.iter().zip(&delta).map(|(w, d)| w + d).collect();

        let mut frame = Frame { time_decay, att_k: k, att_a: vec![] };
        self.hooks.run(Hook::PreAttTimeDecayActivate(self.layer), &mut frame)?;
        let Frame { time_decay, att_k: k, .. } = frame;
        let w: Vec<f32> = time_decay.iter().map(|w| (-w.exp()).exp()).collect();

        let mut out = wkv_heads(&r, &k, &v, &w, &att.first, kv, self.num_emb / self.num_head);
        att.ln_x.apply_groups(&mut out, self.num_head)?;
        att.output.apply(&mul(&out, &g))
    }
}

impl Layer for Block {
    fn forward(&self, x: &mut [f32], state: &mut [f32], _carry: &mut Carry) -> Result<()> {
        let c = self.num_emb;
        let (prev, rest) = state.split_at_mut(c);
        let (kv, ffn_state) = rest.split_at_mut(rest.len() - c);

        let xa = self.ln1.apply(x)?;
        let out = self.time_mix(&xa, prev, kv)?;
        kernels::add_assign(x, &out);

        let xf = self.ln2.apply(x)?;
        let out = self.ffn.forward(&xf, ffn_state)?;
        kernels::add_assign(x, &out);
        Ok(())
    }
}
