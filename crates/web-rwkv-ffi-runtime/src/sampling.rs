//! Token sampling from logits
//!
//! Order of operations: temperature scaling, softmax, top-p nucleus, top-k
//! truncation, renormalisation, then a categorical draw from the process RNG.
//! `top_k == 1` or a non-positive temperature selects the argmax.

use parking_lot::Mutex;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use web_rwkv_ffi_core::{Error, Result};
use web_rwkv_ffi_cpu::kernels;

/// Sampler configuration passed by value across the C ABI
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub temp: f32,
    pub top_p: f32,
    /// 0 = no cap
    pub top_k: usize,
}

impl Default for Sampler {
    fn default() -> Self {
        Self { temp: 1.0, top_p: 1.0, top_k: 0 }
    }
}

impl Sampler {
    pub fn is_greedy(&self) -> bool {
        self.top_k == 1 || self.temp <= 0.0
    }

    /// Candidate `(token, probability)` pairs after filtering, renormalised.
    pub fn candidates(&self, logits: &[f32]) -> Vec<(usize, f32)> {
        let scaled: Vec<f32> = logits.iter().map(|&x| x / self.temp).collect();
        let probs = kernels::softmax(&scaled);

        let mut sorted: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        // Stable, so tied tokens stay in id order
        sorted.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        // Smallest prefix whose mass reaches top_p
        let top_p = self.top_p.clamp(0.0, 1.0);
        let mut mass = 0.0;
        let mut keep = sorted.len();
        for (index, (_, p)) in sorted.iter().enumerate() {
            mass += p;
            if mass >= top_p {
                keep = index + 1;
                break;
            }
        }
        if self.top_k > 0 {
            keep = keep.min(self.top_k);
        }
        sorted.truncate(keep.max(1));

        let sum: f32 = sorted.iter().map(|(_, p)| p).sum();
        if sum > 0.0 {
            sorted.iter_mut().for_each(|(_, p)| *p /= sum);
        }
        sorted
    }

    /// Pick the next token.
    pub fn sample(&self, logits: &[f32], rng: &mut impl Rng) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::InvalidArgument("cannot sample from empty logits".into()));
        }
        if self.temp <= 0.0 && self.top_k != 1 {
            log::warn!("non-positive temperature {}, sampling greedily", self.temp);
        }
        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        let candidates = self.candidates(logits);
        let dist = WeightedIndex::new(candidates.iter().map(|(_, p)| *p))
            .map_err(|e| Error::InvalidArgument(format!("degenerate distribution: {e}")))?;
        Ok(candidates[dist.sample(rng)].0 as u32)
    }
}

/// Index of the largest logit
pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as u32)
        .unwrap_or(0)
}

static RNG: Mutex<Option<StdRng>> = Mutex::new(None);

/// Reseed the process RNG.
pub fn seed(seed: u64) {
    *RNG.lock() = Some(StdRng::seed_from_u64(seed));
}

/// Run `f` with the process RNG, seeding it with 0 on first use.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut rng = RNG.lock();
    f(rng.get_or_insert_with(|| StdRng::seed_from_u64(0)))
}
