//! Randomly initialised checkpoints with the RWKV tensor layout
//!
//! Used by tests and benches to exercise every model version without shipping
//! real weights.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use std::path::Path;
use web_rwkv_ffi_core::{ModelInfo, ModelVersion, Result};

/// Rank of the low-rank adapters of v6 and v7 checkpoints
pub const LORA_RANK: usize = 4;

/// Shape and seed of a synthetic checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub version: ModelVersion,
    pub num_layer: usize,
    pub num_emb: usize,
    pub num_hidden: usize,
    pub num_vocab: usize,
    pub num_head: usize,
    pub seed: u64,
}

impl SyntheticConfig {
    /// A tiny model of the given version
    pub fn tiny(version: ModelVersion) -> Self {
        let num_head = match version {
            ModelVersion::V4 => 1,
            _ => 2,
        };
        Self { version, num_layer: 2, num_emb: 16, num_hidden: 40, num_vocab: 32, num_head, seed: 0 }
    }

    pub fn with_layers(mut self, num_layer: usize) -> Self {
        self.num_layer = num_layer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Metadata a loader is expected to detect
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            version: self.version,
            num_layer: self.num_layer,
            num_emb: self.num_emb,
            num_hidden: self.num_hidden,
            num_vocab: self.num_vocab,
            num_head: self.num_head,
        }
    }
}

struct Builder {
    rng: StdRng,
    tensors: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl Builder {
    fn push(&mut self, name: String, shape: Vec<usize>, data: Vec<f32>) {
        self.tensors.push((name, shape, data));
    }

    fn uniform(&mut self, name: String, shape: Vec<usize>, low: f32, high: f32) {
        let len = shape.iter().product();
        let data = (0..len).map(|_| self.rng.random_range(low..high)).collect();
        self.push(name, shape, data);
    }

    /// Linear weight `[rows, cols]` scaled by `1 / sqrt(cols)`
    fn linear(&mut self, name: String, rows: usize, cols: usize) {
        let bound = 1.0 / (cols as f32).sqrt();
        self.uniform(name, vec![rows, cols], -bound, bound);
    }

    fn norm(&mut self, prefix: &str, c: usize) {
        self.uniform(format!("{prefix}.weight"), vec![c], 0.8, 1.2);
        self.uniform(format!("{prefix}.bias"), vec![c], -0.1, 0.1);
    }

    /// Mixing coefficients exported as `[1, 1, C]`
    fn mix(&mut self, name: String, c: usize) {
        self.uniform(name, vec![1, 1, c], 0.0, 1.0);
    }
}

/// Generate every tensor of a checkpoint as `(name, shape, data)`.
pub fn tensors(config: &SyntheticConfig) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let (c, f, v) = (config.num_emb, config.num_hidden, config.num_vocab);
    let (h, s, rank) = (config.num_head, config.num_emb / config.num_head, LORA_RANK);
    let mut b = Builder { rng: StdRng::seed_from_u64(config.seed), tensors: vec![] };

    b.uniform("emb.weight".into(), vec![v, c], -1.0, 1.0);
    b.norm("blocks.0.ln0", c);

    for layer in 0..config.num_layer {
        let att = format!("blocks.{layer}.att");
        let ffn = format!("blocks.{layer}.ffn");
        b.norm(&format!("blocks.{layer}.ln1"), c);
        b.norm(&format!("blocks.{layer}.ln2"), c);

        for matrix in ["key", "value", "receptance", "output"] {
            b.linear(format!("{att}.{matrix}.weight"), c, c);
        }
        b.linear(format!("{ffn}.key.weight"), f, c);
        b.linear(format!("{ffn}.value.weight"), c, f);

        match config.version {
            ModelVersion::V4 | ModelVersion::V5 => {
                let mixes: &[&str] = match config.version {
                    ModelVersion::V4 => &["k", "v", "r"],
                    _ => &["k", "v", "r", "g"],
                };
                for m in mixes {
                    b.mix(format!("{att}.time_mix_{m}"), c);
                }
                if config.version == ModelVersion::V4 {
                    b.uniform(format!("{att}.time_decay"), vec![c], -2.0, 1.0);
                    b.uniform(format!("{att}.time_first"), vec![c], -1.0, 1.0);
                } else {
                    b.uniform(format!("{att}.time_decay"), vec![h, s], -2.0, 1.0);
                    b.uniform(format!("{att}.time_faaaa"), vec![h, s], -1.0, 1.0);
                    b.linear(format!("{att}.gate.weight"), c, c);
                    b.norm(&format!("{att}.ln_x"), c);
                }
                b.mix(format!("{ffn}.time_mix_k"), c);
                b.mix(format!("{ffn}.time_mix_r"), c);
                b.linear(format!("{ffn}.receptance.weight"), c, c);
            }
            ModelVersion::V6 => {
                for m in ["x", "w", "k", "v", "r", "g"] {
                    b.mix(format!("{att}.time_maa_{m}"), c);
                }
                b.uniform(format!("{att}.time_maa_w1"), vec![c, 5 * rank], -0.1, 0.1);
                b.uniform(format!("{att}.time_maa_w2"), vec![5, rank, c], -0.1, 0.1);
                b.uniform(format!("{att}.time_decay"), vec![1, 1, c], -2.0, 1.0);
                b.uniform(format!("{att}.time_decay_w1"), vec![c, rank], -0.1, 0.1);
                b.uniform(format!("{att}.time_decay_w2"), vec![rank, c], -0.1, 0.1);
                b.uniform(format!("{att}.time_faaaa"), vec![h, s], -1.0, 1.0);
                b.linear(format!("{att}.gate.weight"), c, c);
                b.norm(&format!("{att}.ln_x"), c);
                b.mix(format!("{ffn}.time_maa_k"), c);
                b.mix(format!("{ffn}.time_maa_r"), c);
                b.linear(format!("{ffn}.receptance.weight"), c, c);
            }
            ModelVersion::V7 => {
                for m in ["r", "w", "k", "v", "a", "g"] {
                    b.mix(format!("{att}.x_{m}"), c);
                }
                let adapters: &[&str] = match layer {
                    0 => &["w", "a", "g"],
                    _ => &["w", "a", "v", "g"],
                };
                for lora in adapters {
                    if *lora != "g" {
                        b.uniform(format!("{att}.{lora}0"), vec![1, 1, c], -0.5, 0.5);
                    }
                    b.uniform(format!("{att}.{lora}1"), vec![c, rank], -0.2, 0.2);
                    b.uniform(format!("{att}.{lora}2"), vec![rank, c], -0.2, 0.2);
                }
                b.uniform(format!("{att}.k_k"), vec![1, 1, c], 0.5, 1.0);
                b.uniform(format!("{att}.k_a"), vec![1, 1, c], 0.5, 1.0);
                b.uniform(format!("{att}.r_k"), vec![h, s], -0.5, 0.5);
                b.norm(&format!("{att}.ln_x"), c);
                b.mix(format!("{ffn}.x_k"), c);
            }
        }
    }

    b.norm("ln_out", c);
    b.linear("head.weight".into(), v, c);
    b.tensors
}

/// Write a synthetic checkpoint to `path` as f32 safetensors.
pub fn write(config: &SyntheticConfig, path: impl AsRef<Path>) -> Result<()> {
    write_tensors(&tensors(config), path)
}

/// Write named f32 tensors to `path`, e.g. a tampered copy of [`tensors`].
pub fn write_tensors(tensors: &[(String, Vec<usize>, Vec<f32>)], path: impl AsRef<Path>) -> Result<()> {
    let views = tensors
        .iter()
        .map(|(name, shape, data)| {
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytemuck::cast_slice(data))?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use web_rwkv_ffi_core::Loader;

    #[test]
    fn test_layout_detected() {
        let dir = tempfile::tempdir().unwrap();
        for version in [ModelVersion::V4, ModelVersion::V5, ModelVersion::V6, ModelVersion::V7] {
            let config = SyntheticConfig::tiny(version).with_layers(3);
            let path = dir.path().join(format!("{version}.st"));
            write(&config, &path).unwrap();

            let loader = Loader::open(&path).unwrap();
            assert_eq!(loader.info_from_layout().unwrap(), config.info());
        }
    }

    #[test]
    fn test_seeded() {
        let config = SyntheticConfig::tiny(ModelVersion::V5);
        assert_eq!(tensors(&config), tensors(&config));
        assert_ne!(tensors(&config), tensors(&config.with_seed(1)));
    }
}
