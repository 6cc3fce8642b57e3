//! Hook points inside the time-mix of v6 and v7 blocks
//!
//! A hook receives the intermediate buffers of the current token and may rewrite
//! them in place before the block continues.

use std::collections::HashMap;
use web_rwkv_ffi_core::{ModelInfo, ModelVersion, Result};

/// Location of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// v6: before the data-dependent decay `w` goes through `exp(-exp(w))`
    PreAttTimeDecayActivate(usize),
    /// v7: after the in-context learning rate `a` is computed
    PostAttAdapt(usize),
    /// v7: after decay and learning rate are final, before the state update
    PostAttControl(usize),
}

/// Intermediate time-mix buffers of one token
#[derive(Debug, Default)]
pub struct Frame {
    /// v6: pre-activation decay; v7: log decay (`ln w`, always negative)
    pub time_decay: Vec<f32>,
    pub att_k: Vec<f32>,
    /// v7 in-context learning rate (empty for v6)
    pub att_a: Vec<f32>,
}

pub type HookFn = Box<dyn Fn(&mut Frame) -> Result<()> + Send + Sync>;

/// Hooks installed on a model
#[derive(Default)]
pub struct HookMap(HashMap<Hook, HookFn>);

impl HookMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hook: Hook, f: HookFn) {
        self.0.insert(hook, f);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run the hook at `hook`, if one is installed.
    pub fn run(&self, hook: Hook, frame: &mut Frame) -> Result<()> {
        match self.0.get(&hook) {
            Some(f) => f(frame),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for HookMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Extended hooks for v6: the decay is shifted by the squashed key.
fn extended_v6(info: &ModelInfo) -> HookMap {
    let mut hooks = HookMap::new();
    for layer in 0..info.num_layer {
        hooks.insert(
            Hook::PreAttTimeDecayActivate(layer),
            Box::new(|frame: &mut Frame| {
                for (w, k) in frame.time_decay.iter_mut().zip(&frame.att_k) {
                    *w += k.tanh();
                }
                Ok(())
            }),
        );
    }
    hooks
}

/// Extended hooks for v7: the learning rate is doubled, then scales the decay rate.
fn extended_v7(info: &ModelInfo) -> HookMap {
    let mut hooks = HookMap::new();
    for layer in 0..info.num_layer {
        hooks.insert(
            Hook::PostAttAdapt(layer),
            Box::new(|frame: &mut Frame| {
                frame.att_a.iter_mut().for_each(|a| *a *= 2.0);
                Ok(())
            }),
        );
        hooks.insert(
            Hook::PostAttControl(layer),
            Box::new(|frame: &mut Frame| {
                for (w, a) in frame.time_decay.iter_mut().zip(&frame.att_a) {
                    *w *= a;
                }
                Ok(())
            }),
        );
    }
    hooks
}

/// Hooks installed by the extended load path; v4 and v5 have no hook points.
pub fn extended(info: &ModelInfo) -> HookMap {
    match info.version {
        ModelVersion::V4 | ModelVersion::V5 => HookMap::new(),
        ModelVersion::V6 => extended_v6(info),
        ModelVersion::V7 => extended_v7(info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: ModelVersion) -> ModelInfo {
        ModelInfo { version, num_layer: 3, num_emb: 4, num_hidden: 8, num_vocab: 10, num_head: 1 }
    }

    #[test]
    fn test_extended_counts() {
        assert!(extended(&info(ModelVersion::V4)).is_empty());
        assert!(extended(&info(ModelVersion::V5)).is_empty());
        assert_eq!(extended(&info(ModelVersion::V6)).len(), 3);
        assert_eq!(extended(&info(ModelVersion::V7)).len(), 6);
    }

    #[test]
    fn test_v7_hooks() {
        let hooks = extended(&info(ModelVersion::V7));
        let mut frame = Frame { time_decay: vec![-0.5, -0.2], att_k: vec![], att_a: vec![0.25, 0.5] };

        hooks.run(Hook::PostAttAdapt(1), &mut frame).unwrap();
        assert_eq!(frame.att_a, vec![0.5, 1.0]);
        hooks.run(Hook::PostAttControl(1), &mut frame).unwrap();
        assert_eq!(frame.time_decay, vec![-0.25, -0.2]);

        // No hook at this point for v7
        hooks.run(Hook::PreAttTimeDecayActivate(0), &mut frame).unwrap();
        assert_eq!(frame.time_decay, vec![-0.25, -0.2]);
    }
}
