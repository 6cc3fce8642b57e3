//! RWKV v5 block
//!
//! Multi-head matrix state with a static per-channel decay and a SiLU output gate.

use super::v4::ChannelMix;
use super::weights::WeightSource;
use super::{mul, wkv_heads, Carry, Layer, LayerNorm};
use web_rwkv_ffi_core::{ModelInfo, Result};
use web_rwkv_ffi_cpu::kernels;
use web_rwkv_ffi_cpu::Matrix;

struct TimeMix {
    mix_k: Vec<f32>,
    mix_v: Vec<f32>,
    mix_r: Vec<f32>,
    mix_g: Vec<f32>,
    /// `exp(-exp(time_decay))`
    decay: Vec<f32>,
    first: Vec<f32>,
    key: Matrix,
    value: Matrix,
    receptance: Matrix,
    gate: Matrix,
    output: Matrix,
    ln_x: LayerNorm,
}

pub struct Block {
    ln1: LayerNorm,
    ln2: LayerNorm,
    att: TimeMix,
    ffn: ChannelMix,
    num_emb: usize,
    num_head: usize,
}

impl Block {
    pub fn load(source: &dyn WeightSource, info: &ModelInfo, layer: usize) -> Result<Self> {
        let c = info.num_emb;
        let att = format!("blocks.{layer}.att");

        let mut decay = source.vector_of(&format!("{att}.time_decay"), c)?;
        decay.iter_mut().for_each(|w| *w = (-w.exp()).exp());
        let first = match source.contains(&format!("{att}.time_faaaa")) {
            true => source.vector_of(&format!("{att}.time_faaaa"), c)?,
            false => source.vector_of(&format!("{att}.time_first"), c)?,
        };

        let att = TimeMix {
            mix_k: source.vector_of(&format!("{att}.time_mix_k"), c)?,
            mix_v: source.vector_of(&format!("{att}.time_mix_v"), c)?,
            mix_r: source.vector_of(&format!("{att}.time_mix_r"), c)?,
            mix_g: source.vector_of(&format!("{att}.time_mix_g"), c)?,
            decay,
            first,
            key: source.matrix_of(&format!("{att}.key.weight"), c, c)?,
            value: source.matrix_of(&format!("{att}.value.weight"), c, c)?,
            receptance: source.matrix_of(&format!("{att}.receptance.weight"), c, c)?,
            gate: source.matrix_of(&format!("{att}.gate.weight"), c, c)?,
            output: source.matrix_of(&format!("{att}.output.weight"), c, c)?,
            ln_x: LayerNorm::load(source, &format!("{att}.ln_x"), c)?,
        };

        Ok(Self {
            ln1: LayerNorm::load(source, &format!("blocks.{layer}.ln1"), c)?,
            ln2: LayerNorm::load(source, &format!("blocks.{layer}.ln2"), c)?,
            att,
            ffn: ChannelMix::load(source, &format!("blocks.{layer}.ffn"), c, info.num_hidden)?,
            num_emb: c,
            num_head: info.num_head,
        })
    }

    fn time_mix(&self, x: &[f32], prev: &mut [f32], kv: &mut [f32]) -> Result<Vec<f32>> {
        let c = self.num_emb;
        let att = &self.att;

        let mut mixed = [vec![0.0; c], vec![0.0; c], vec![0.0; c], vec![0.0; c]];
        for (out, mix) in mixed.iter_mut().zip([&att.mix_k, &att.mix_v, &att.mix_r, &att.mix_g]) {
            kernels::token_mix(x, prev, mix, out);
        }
        prev.copy_from_slice(x);
        let [xk, xv, xr, xg] = mixed;

        let r = att.receptance.apply(&xr)?;
        let k = att.key.apply(&xk)?;
        let v = att.value.apply(&xv)?;
        let mut g = att.gate.apply(&xg)?;
        kernels::silu_inplace(&mut g);

        let mut out = wkv_heads(&r, &k, &v, &att.decay, &att.first, kv, c / self.num_head);
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
