//! Model architecture metadata and version detection

use crate::error::{Error, Result};
use crate::tensor::Shape;
use serde::{Deserialize, Serialize};
use std::fmt;

/// RWKV architecture generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVersion {
    V4,
    V5,
    V6,
    V7,
}

impl ModelVersion {
    /// Numeric version as reported across the C ABI
    pub fn as_number(&self) -> usize {
        match self {
            ModelVersion::V4 => 4,
            ModelVersion::V5 => 5,
            ModelVersion::V6 => 6,
            ModelVersion::V7 => 7,
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_number())
    }
}

/// Static architecture metadata of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: ModelVersion,
    pub num_layer: usize,
    pub num_emb: usize,
    pub num_hidden: usize,
    pub num_vocab: usize,
    pub num_head: usize,
}

impl ModelInfo {
    /// Channels per head
    pub fn head_size(&self) -> usize {
        self.num_emb / self.num_head
    }

    /// Derive metadata from tensor names and shapes.
    ///
    /// `shape` returns the shape of a named tensor, or `None` if the checkpoint lacks it.
    pub fn detect(shape: impl Fn(&str) -> Option<Shape>) -> Result<Self> {
        let require = |name: &str| shape(name).ok_or_else(|| Error::missing_tensor(name));

        let (num_vocab, num_emb) = require("emb.weight")?.matrix()?;
        let num_layer = (0..).take_while(|layer| shape(&format!("blocks.{layer}.ln1.weight")).is_some()).count();
        if num_layer == 0 {
            return Err(Error::ModelLoadFailure("checkpoint has no layers".into()));
        }
        let (num_hidden, _) = require("blocks.0.ffn.key.weight")?.matrix()?;

        let version = if shape("blocks.0.att.r_k").is_some() {
            ModelVersion::V7
        } else if shape("blocks.0.att.time_maa_x").is_some() {
            ModelVersion::V6
        } else if shape("blocks.0.att.ln_x.weight").is_some() {
            ModelVersion::V5
        } else {
            ModelVersion::V4
        };

        let num_head = match version {
            ModelVersion::V4 => 1,
            ModelVersion::V5 | ModelVersion::V6 => {
                let time_first = shape("blocks.0.att.time_first")
                    .or_else(|| shape("blocks.0.att.time_faaaa"))
                    .ok_or_else(|| Error::missing_tensor("blocks.0.att.time_first"))?;
                head_count(&time_first)
            }
            ModelVersion::V7 => head_count(&require("blocks.0.att.r_k")?),
        };
        if num_head == 0 || num_emb % num_head != 0 {
            return Err(Error::ModelLoadFailure(format!(
                "embedding size {num_emb} is not divisible by {num_head} heads"
            )));
        }

        Ok(Self { version, num_layer, num_emb, num_hidden, num_vocab, num_head })
    }
}

/// Heads of a per-head parameter stored as `[num_head, head_size]`
fn head_count(shape: &Shape) -> usize {
    match shape.dims() {
        [num_head, _, ..] => *num_head,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn shapes(entries: &[(&str, &[usize])]) -> HashMap<String, Shape> {
        entries.iter().map(|(name, dims)| (name.to_string(), Shape::from(*dims))).collect()
    }

    #[test]
    fn test_detect_v4() {
        let map = shapes(&[
            ("emb.weight", &[100, 16]),
            ("blocks.0.ln1.weight", &[16]),
            ("blocks.1.ln1.weight", &[16]),
            ("blocks.0.ffn.key.weight", &[64, 16]),
        ]);
        let info = ModelInfo::detect(|name| map.get(name).cloned()).unwrap();
        assert_eq!(info.version, ModelVersion::V4);
        assert_eq!(info.num_layer, 2);
        assert_eq!(info.num_vocab, 100);
        assert_eq!(info.num_emb, 16);
        assert_eq!(info.num_hidden, 64);
        assert_eq!(info.num_head, 1);
    }

    #[test]
    fn test_detect_v6_heads() {
        let map = shapes(&[
            ("emb.weight", &[100, 16]),
            ("blocks.0.ln1.weight", &[16]),
            ("blocks.0.ffn.key.weight", &[56, 16]),
            ("blocks.0.att.ln_x.weight", &[16]),
            ("blocks.0.att.time_maa_x", &[1, 1, 16]),
            ("blocks.0.att.time_faaaa", &[4, 4]),
        ]);
        let info = ModelInfo::detect(|name| map.get(name).cloned()).unwrap();
        assert_eq!(info.version, ModelVersion::V6);
        assert_eq!(info.num_head, 4);
        assert_eq!(info.head_size(), 4);
    }

    #[test]
    fn test_detect_v7() {
        let map = shapes(&[
            ("emb.weight", &[100, 16]),
            ("blocks.0.ln1.weight", &[16]),
            ("blocks.0.ffn.key.weight", &[64, 16]),
            ("blocks.0.att.ln_x.weight", &[16]),
            ("blocks.0.att.r_k", &[2, 8]),
        ]);
        let info = ModelInfo::detect(|name| map.get(name).cloned()).unwrap();
        assert_eq!(info.version, ModelVersion::V7);
        assert_eq!(info.num_head, 2);
        assert_eq!(info.version.as_number(), 7);
    }

    #[test]
    fn test_detect_single_head() {
        let map = shapes(&[
            ("emb.weight", &[100, 16]),
            ("blocks.0.ln1.weight", &[16]),
            ("blocks.0.ffn.key.weight", &[64, 16]),
            ("blocks.0.att.ln_x.weight", &[16]),
            ("blocks.0.att.time_faaaa", &[1, 16]),
        ]);
        let info = ModelInfo::detect(|name| map.get(name).cloned()).unwrap();
        assert_eq!(info.version, ModelVersion::V5);
        assert_eq!(info.num_head, 1);

        let map = shapes(&[
            ("emb.weight", &[100, 16]),
            ("blocks.0.ln1.weight", &[16]),
            ("blocks.0.ffn.key.weight", &[64, 16]),
            ("blocks.0.att.ln_x.weight", &[16]),
            ("blocks.0.att.time_faaaa", &[16]),
        ]);
        assert!(ModelInfo::detect(|name| map.get(name).cloned()).is_err());
    }

    #[test]
    fn test_detect_missing_embedding() {
        let map = shapes(&[("blocks.0.ln1.weight", &[16])]);
        let err = ModelInfo::detect(|name| map.get(name).cloned()).unwrap_err();
        assert!(matches!(err, Error::ModelLoadFailure(_)));
    }
}
