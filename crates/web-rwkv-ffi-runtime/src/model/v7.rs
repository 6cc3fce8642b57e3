//! RWKV v7 block
//!
//! Generalised delta rule: the state decays per key channel, forgets along an
//! L2-normalised removal key scaled by the in-context learning rate `a`, and
//! adds the new `v k^T`. Values of later blocks are mixed with the first block's.

use super::hooks::{Frame, Hook, HookMap};
use super::weights::WeightSource;
use super::{mul, Carry, Layer, LayerNorm, LoRA};
use std::sync::Arc;
use web_rwkv_ffi_core::{Error, ModelInfo, Result};
use web_rwkv_ffi_cpu::kernels;
use web_rwkv_ffi_cpu::Matrix;

/// `exp(-0.5)`: bounds the log decay to `(-exp(-0.5), 0)`
const DECAY_SCALE: f32 = 0.606_530_66;

struct ValueResidual {
    v0: Vec<f32>,
    lora: LoRA,
}

struct TimeMix {
    /// `x_r, x_w, x_k, x_v, x_a, x_g`
    mix: [Vec<f32>; 6],
    w0: Vec<f32>,
    w_lora: LoRA,
    a0: Vec<f32>,
    a_lora: LoRA,
    /// Absent in the first block, whose values become `v_first`
    v_residual: Option<ValueResidual>,
    g_lora: LoRA,
    k_k: Vec<f32>,
    k_a: Vec<f32>,
    r_k: Vec<f32>,
    key: Matrix,
    value: Matrix,
    receptance: Matrix,
    output: Matrix,
    ln_x: LayerNorm,
}

struct ChannelMix {
    x_k: Vec<f32>,
    key: Matrix,
    value: Matrix,
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
        let name = |suffix: &str| format!("{att}.{suffix}");
        let lora = |prefix: &str| LoRA::load(source, &name(&format!("{prefix}1")), &name(&format!("{prefix}2")), c);

        let [r, w, k, v, a, g] = ["x_r", "x_w", "x_k", "x_v", "x_a", "x_g"].map(|x| source.vector_of(&name(x), c));
        let v_residual = match source.contains(&name("v1")) {
            true => Some(ValueResidual { v0: source.vector_of(&name("v0"), c)?, lora: lora("v")? }),
            false if layer == 0 => None,
            false => return Err(Error::missing_tensor(&name("v1"))),
        };

        let att = TimeMix {
            mix: [r?, w?, k?, v?, a?, g?],
            w0: source.vector_of(&name("w0"), c)?,
            w_lora: lora("w")?,
            a0: source.vector_of(&name("a0"), c)?,
            a_lora: lora("a")?,
            v_residual,
            g_lora: lora("g")?,
            k_k: source.vector_of(&name("k_k"), c)?,
            k_a: source.vector_of(&name("k_a"), c)?,
            r_k: source.vector_of(&name("r_k"), c)?,
            key: source.matrix_of(&name("key.weight"), c, c)?,
            value: source.matrix_of(&name("value.weight"), c, c)?,
            receptance: source.matrix_of(&name("receptance.weight"), c, c)?,
            output: source.matrix_of(&name("output.weight"), c, c)?,
            ln_x: LayerNorm::load(source, &name("ln_x"), c)?,
        };

        let ffn = format!("blocks.{layer}.ffn");
        let ffn = ChannelMix {
            x_k: source.vector_of(&format!("{ffn}.x_k"), c)?,
            key: source.matrix_of(&format!("{ffn}.key.weight"), info.num_hidden, c)?,
            value: source.matrix_of(&format!("{ffn}.value.weight"), c, info.num_hidden)?,
        };

        Ok(Self {
            layer,
            ln1: LayerNorm::load(source, &format!("blocks.{layer}.ln1"), c)?,
            ln2: LayerNorm::load(source, &format!("blocks.{layer}.ln2"), c)?,
            att,
            ffn,
            hooks,
            num_emb: c,
            num_head: info.num_head,
        })
    }

    fn time_mix(&self, x: &[f32], prev: &mut [f32], kv: &mut [f32], carry: &mut Carry) -> Result<Vec<f32>> {
        let (c, att) = (self.num_emb, &self.att);
        let head_size = c / self.num_head;

        let mut mixed: [Vec<f32>; 6] = Default::default();
        for (out, mix) in mixed.iter_mut().zip(&att.mix) {
            *out = vec![0.0; c];
            kernels::token_lerp(x, prev, mix, out);
        }
        prev.copy_from_slice(x);
        let [xr, xw, xk, xv, xa, xg] = mixed;

        let r = att.receptance.apply(&xr)?;
        let mut k = att.key.apply(&xk)?;
        let mut v = att.value.apply(&xv)?;

        let mut time_decay = att.w_lora.apply(&xw, kernels::tanh_inplace)?;
        for (w, w0) in time_decay.iter_mut().zip(&att.w0) {
            *w = -DECAY_SCALE * kernels::sigmoid(w0 + *w);
        }

        let mut a = att.a_lora.apply(&xa, |_| ())?;
        kernels::add_assign(&mut a, &att.a0);
        kernels::sigmoid_inplace(&mut a);

        let mut frame = Frame { time_decay, att_k: vec![], att_a: a };
        self.hooks.run(Hook::PostAttAdapt(self.layer), &mut frame)?;

        match (&att.v_residual, &carry.v_first) {
            (Some(residual), Some(v_first)) => {
                let mut gate = residual.lora.apply(&xv, |_| ())?;
                kernels::add_assign(&mut gate, &residual.v0);
                kernels::sigmoid_inplace(&mut gate);
                for ((v, first), gate) in v.iter_mut().zip(v_first).zip(&gate) {
                    *v += (first - *v) * gate;
                }
            }
            (_, None) => carry.v_first = Some(v.clone()),
            (None, Some(_)) => {}
        }

        let g = att.g_lora.apply(&xg, kernels::sigmoid_inplace)?;

        let mut kk = mul(&k, &att.k_k);
        kernels::l2_normalize(&mut kk, self.num_head)?;
        for ((k, a), k_a) in k.iter_mut().zip(&frame.att_a).zip(&att.k_a) {
            *k *= 1.0 + (a - 1.0) * k_a;
        }

        frame.att_k = k;
        self.hooks.run(Hook::PostAttControl(self.layer), &mut frame)?;
        let Frame { time_decay, att_k: k, att_a: a } = frame;
        let w: Vec<f32> = time_decay.iter().map(|w| w.exp()).collect();

        let mut out = delta_rule_heads(&r, &w, &k, &v, (&kk, &a), kv, head_size);
        att.ln_x.apply_groups(&mut out, self.num_head)?;

        for h in 0..self.num_head {
            let range = h * head_size..(h + 1) * head_size;
            let bonus: f32 = range.clone().map(|j| r[j] * k[j] * att.r_k[j]).sum();
            for i in range {
                out[i] += bonus * v[i];
            }
        }

        att.output.apply(&mul(&out, &g))
    }

    fn channel_mix(&self, x: &[f32], prev: &mut [f32]) -> Result<Vec<f32>> {
        let mut xk = vec![0.0; x.len()];
        kernels::token_lerp(x, prev, &self.ffn.x_k, &mut xk);
        prev.copy_from_slice(x);

        let mut k = self.ffn.key.apply(&xk)?;
        kernels::relu_squared_inplace(&mut k);
        self.ffn.value.apply(&k)
    }
}

/// Per-head delta-rule state update.
///
/// Row `i` of a head's state is indexed by value, column `j` by key:
/// `s_ij = s_ij w_j + (sum_l -s_il kk_l) kk_j a_j + v_i k_j`, then `out_i = sum_j s_ij r_j`.
/// `w` is the decay factor, already exponentiated.
pub(crate) fn delta_rule_heads(
    r: &[f32],
    w: &[f32],
    k: &[f32],
    v: &[f32],
    (kk, a): (&[f32], &[f32]),
    kv: &mut [f32],
    head_size: usize,
) -> Vec<f32> {
    let mut out = vec![0.0; r.len()];
    for (h, s) in kv.chunks_mut(head_size * head_size).enumerate() {
        let range = h * head_size..(h + 1) * head_size;
        let (r, k, v) = (&r[range.clone()], &k[range.clone()], &v[range.clone()]);
        let (w, kk, a) = (&w[range.clone()], &kk[range.clone()], &a[range.clone()]);
        let out = &mut out[range];

        for (i, row) in s.chunks_mut(head_size).enumerate() {
            let sa: f32 = row.iter().zip(kk).map(|(s, kk)| -s * kk).sum();
            let mut y = 0.0;
            for j in 0..head_size {
                row[j] = row[j] * w[j] + sa * kk[j] * a[j] + v[i] * k[j];
                y += row[j] * r[j];
            }
            out[i] = y;
        }
    }
    out
}

impl Layer for Block {
    fn forward(&self, x: &mut [f32], state: &mut [f32], carry: &mut Carry) -> Result<()> {
        let c = self.num_emb;
        let (prev, rest) = state.split_at_mut(c);
        let (kv, ffn_state) = rest.split_at_mut(rest.len() - c);

        let xa = self.ln1.apply(x)?;
        let out = self.time_mix(&xa, prev, kv, carry)?;
        kernels::add_assign(x, &out);

        let xf = self.ln2.apply(x)?;
        let out = self.channel_mix(&xf, ffn_state)?;
        kernels::add_assign(x, &out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert!(
            actual.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-5),
            "{actual:?} != {expected:?}"
        );
    }

    #[test]
    fn test_delta_rule_two_steps() {
        let (w, kk, a) = ([0.9, 0.8], [0.6, 0.8], [0.5, 1.0]);
        let mut kv = vec![0.0; 4];

        // Empty state: s = v k^T and out_i = v_i (k . r)
        let out = delta_rule_heads(&[1.0, 2.0], &w, &[0.5, 1.0], &[3.0, 4.0], (&kk, &a), &mut kv, 2);
        assert_close(&out, &[7.5, 10.0]);
        assert_close(&kv, &[1.5, 3.0, 2.0, 4.0]);

        // No new key: only decay and removal along kk.
        // Row 0: sa = -3.3, row 1: sa = -4.4
        let out = delta_rule_heads(&[1.0, 0.0], &w, &[0.0, 0.0], &[1.0, 1.0], (&kk, &a), &mut kv, 2);
        assert_close(&kv, &[0.36, -0.24, 0.48, -0.32]);
        assert_close(&out, &[0.36, 0.48]);
    }

    #[test]
    fn test_delta_rule_heads_are_independent() {
        let ones = [1.0; 4];
        let mut kv = vec![0.0; 8];
        let k = [1.0, 0.0, 0.0, 2.0];
        let v = [1.0, 2.0, 3.0, 4.0];
        let out = delta_rule_heads(&ones, &ones, &k, &v, (&[0.0; 4], &ones), &mut kv, 2);
        assert_close(&out, &[1.0, 2.0, 6.0, 8.0]);
        assert_close(&kv, &[1.0, 0.0, 2.0, 0.0, 0.0, 6.0, 0.0, 8.0]);
    }
}
