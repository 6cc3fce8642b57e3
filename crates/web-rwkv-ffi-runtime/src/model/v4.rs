//! RWKV v4 block
//!
//! Single-head WKV with the numerically stable `aa / bb / pp` accumulators.

use super::weights::WeightSource;
use super::{mul, Carry, Layer, LayerNorm};
use web_rwkv_ffi_core::{ModelInfo, Result};
use web_rwkv_ffi_cpu::kernels;
use web_rwkv_ffi_cpu::Matrix;

struct TimeMix {
    mix_k: Vec<f32>,
    mix_v: Vec<f32>,
    mix_r: Vec<f32>,
    /// `-exp(time_decay)`
    decay: Vec<f32>,
    first: Vec<f32>,
    key: Matrix,
    value: Matrix,
    receptance: Matrix,
    output: Matrix,
}

/// Squared-ReLU channel mix with receptance gate (v4, v5 and v6)
pub(crate) struct ChannelMix {
    mix_k: Vec<f32>,
    mix_r: Vec<f32>,
    key: Matrix,
    receptance: Matrix,
    value: Matrix,
}

impl ChannelMix {
    /// Load with `x * mix + prev * (1 - mix)` coefficients named `time_mix_k` / `time_mix_r`.
    pub fn load(source: &dyn WeightSource, prefix: &str, c: usize, hidden: usize) -> Result<Self> {
        Self::load_with(source, prefix, (c, hidden), "time_mix_k", "time_mix_r", false)
    }

    /// Load from coefficients in either convention; `lerp` marks the
    /// `x + (prev - x) * maa` form, which is converted on load.
    pub fn load_with(
        source: &dyn WeightSource,
        prefix: &str,
        (c, hidden): (usize, usize),
        k: &str,
        r: &str,
        lerp: bool,
    ) -> Result<Self> {
        let convert = |mut mix: Vec<f32>| {
            if lerp {
                mix.iter_mut().for_each(|m| *m = 1.0 - *m);
            }
            mix
        };
        Ok(Self {
            mix_k: convert(source.vector_of(&format!("{prefix}.{k}"), c)?),
            mix_r: convert(source.vector_of(&format!("{prefix}.{r}"), c)?),
            key: source.matrix_of(&format!("{prefix}.key.weight"), hidden, c)?,
            receptance: source.matrix_of(&format!("{prefix}.receptance.weight"), c, c)?,
            value: source.matrix_of(&format!("{prefix}.value.weight"), c, hidden)?,
        })
    }

    /// `x` is the normalised input, `prev` the previous token's input.
    pub fn forward(&self, x: &[f32], prev: &mut [f32]) -> Result<Vec<f32>> {
        let c = x.len();
        let (mut xk, mut xr) = (vec![0.0; c], vec![0.0; c]);
        kernels::token_mix(x, prev, &self.mix_k, &mut xk);
        kernels::token_mix(x, prev, &self.mix_r, &mut xr);
        prev.copy_from_slice(x);

        let mut r = self.receptance.apply(&xr)?;
        kernels::sigmoid_inplace(&mut r);
        let mut k = self.key.apply(&xk)?;
        kernels::relu_squared_inplace(&mut k);
        let v = self.value.apply(&k)?;
        Ok(mul(&r, &v))
    }
}

/// One v4 block
pub struct Block {
    ln1: LayerNorm,
    ln2: LayerNorm,
    att: TimeMix,
    ffn: ChannelMix,
    num_emb: usize,
}

impl Block {
    pub fn load(source: &dyn WeightSource, info: &ModelInfo, layer: usize) -> Result<Self> {
        let c = info.num_emb;
        let att = format!("blocks.{layer}.att");

        let mut decay = source.vector_of(&format!("{att}.time_decay"), c)?;
        decay.iter_mut().for_each(|w| *w = -w.exp());

        let att = TimeMix {
            mix_k: source.vector_of(&format!("{att}.time_mix_k"), c)?,
            mix_v: source.vector_of(&format!("{att}.time_mix_v"), c)?,
            mix_r: source.vector_of(&format!("{att}.time_mix_r"), c)?,
            decay,
            first: source.vector_of(&format!("{att}.time_first"), c)?,
            key: source.matrix_of(&format!("{att}.key.weight"), c, c)?,
            value: source.matrix_of(&format!("{att}.value.weight"), c, c)?,
            receptance: source.matrix_of(&format!("{att}.receptance.weight"), c, c)?,
            output: source.matrix_of(&format!("{att}.output.weight"), c, c)?,
        };

        Ok(Self {
            ln1: LayerNorm::load(source, &format!("blocks.{layer}.ln1"), c)?,
            ln2: LayerNorm::load(source, &format!("blocks.{layer}.ln2"), c)?,
            att,
            ffn: ChannelMix::load(source, &format!("blocks.{layer}.ffn"), c, info.num_hidden)?,
            num_emb: c,
        })
    }

    fn time_mix(&self, x: &[f32], state: &mut [f32]) -> Result<Vec<f32>> {
        let c = self.num_emb;
        let att = &self.att;
        let (prev, rest) = state.split_at_mut(c);
        let (aa, rest) = rest.split_at_mut(c);
        let (bb, pp) = rest.split_at_mut(c);

        let (mut xk, mut xv, mut xr) = (vec![0.0; c], vec![0.0; c], vec![0.0; c]);
        kernels::token_mix(x, prev, &att.mix_k, &mut xk);
        kernels::token_mix(x, prev, &att.mix_v, &mut xv);
        kernels::token_mix(x, prev, &att.mix_r, &mut xr);
        prev.copy_from_slice(x);

        let k = att.key.apply(&xk)?;
        let v = att.value.apply(&xv)?;
        let mut r = att.receptance.apply(&xr)?;
        kernels::sigmoid_inplace(&mut r);

        let wkv = wkv_step(&att.first, &att.decay, &k, &v, (aa, bb, pp));
        att.output.apply(&mul(&r, &wkv))
    }
}

/// One token of the v4 WKV recurrence.
///
/// With `A = aa * exp(pp)` and `B = bb * exp(pp)` the output is
/// `(A + exp(u + k) v) / (B + exp(u + k))`, then `A = exp(w) A + exp(k) v` and
/// `B = exp(w) B + exp(k)`. `decay` holds `w = -exp(time_decay)`.
pub(crate) fn wkv_step(
    first: &[f32],
    decay: &[f32],
    k: &[f32],
    v: &[f32],
    (aa, bb, pp): (&mut [f32], &mut [f32], &mut [f32]),
) -> Vec<f32> {
    let mut wkv = vec![0.0; k.len()];
    for i in 0..k.len() {
        let ww = first[i] + k[i];
        let p = pp[i].max(ww);
        let e1 = (pp[i] - p).exp();
        let e2 = (ww - p).exp();
        wkv[i] = (e1 * aa[i] + e2 * v[i]) / (e1 * bb[i] + e2);

        let ww = decay[i] + pp[i];
        let p = ww.max(k[i]);
        let e1 = (ww - p).exp();
        let e2 = (k[i] - p).exp();
        aa[i] = e1 * aa[i] + e2 * v[i];
        bb[i] = e1 * bb[i] + e2;
        pp[i] = p;
    }
    wkv
}

impl Layer for Block {
    fn forward(&self, x: &mut [f32], state: &mut [f32], _carry: &mut Carry) -> Result<()> {
        let c = self.num_emb;
        let (att_state, ffn_state) = state.split_at_mut(4 * c);

        let xa = self.ln1.apply(x)?;
        let out = self.time_mix(&xa, att_state)?;
        kernels::add_assign(x, &out);

        let xf = self.ln2.apply(x)?;
        let out = self.ffn.forward(&xf, ffn_state)?;
        kernels::add_assign(x, &out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::V4_PP_INIT;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5 * b.abs().max(1.0)
    }

    #[test]
    fn test_wkv_step_two_tokens() {
        let (u, w) = ([0.5, -1.0], [-0.2, -1.5]);
        let (mut aa, mut bb, mut pp) = (vec![0.0; 2], vec![0.0; 2], vec![V4_PP_INIT; 2]);

        // Empty state: the output is the current value
        let out = wkv_step(&u, &w, &[1.0, -2.0], &[2.0, 5.0], (&mut aa, &mut bb, &mut pp));
        assert!(close(out[0], 2.0) && close(out[1], 5.0), "{out:?}");
        let e = 1f32.exp();
        assert!(close(aa[0] * pp[0].exp(), 2.0 * e));
        assert!(close(bb[0] * pp[0].exp(), e));

        // Second token: channel 0 has u + k = 0
        let out = wkv_step(&u, &w, &[-0.5, 0.0], &[3.0, 1.0], (&mut aa, &mut bb, &mut pp));
        assert!(close(out[0], (2.0 * e + 3.0) / (e + 1.0)), "{out:?}");
        let (a1, b1) = ((-2f32).exp() * 5.0, (-2f32).exp());
        let bonus = (-1f32).exp();
        assert!(close(out[1], (a1 + bonus * 1.0) / (b1 + bonus)), "{out:?}");

        let decay = (-0.2f32).exp();
        assert!(close(aa[0] * pp[0].exp(), decay * 2.0 * e + (-0.5f32).exp() * 3.0));
        assert!(close(bb[0] * pp[0].exp(), decay * e + (-0.5f32).exp()));
        let decay = (-1.5f32).exp();
        assert!(close(aa[1] * pp[1].exp(), decay * a1 + 1.0));
        assert!(close(bb[1] * pp[1].exp(), decay * b1 + 1.0));
    }
}
