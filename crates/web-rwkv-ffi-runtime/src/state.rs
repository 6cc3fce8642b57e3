//! Recurrent state of a batch of independent sequences
//!
//! Each slot is one flat f32 vector, laid out layer after layer:
//! - v4: `[att_x, aa, bb, pp, ffn_x]`, each `num_emb` wide
//! - v5 / v6 / v7: `[att_x, kv, ffn_x]` where `kv` holds one `head_size x head_size`
//!   matrix per head

use web_rwkv_ffi_core::{Error, ModelInfo, ModelVersion, Result};

/// Initial value of the v4 `pp` accumulator (log of a vanishing weight)
pub const V4_PP_INIT: f32 = -1e30;

/// Shape of one slot's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub version: ModelVersion,
    pub num_layer: usize,
    pub num_emb: usize,
    pub head_size: usize,
}

impl StateLayout {
    pub fn new(info: &ModelInfo) -> Self {
        Self {
            version: info.version,
            num_layer: info.num_layer,
            num_emb: info.num_emb,
            head_size: info.head_size(),
        }
    }

    /// Floats per layer
    pub fn layer_len(&self) -> usize {
        match self.version {
            ModelVersion::V4 => 5 * self.num_emb,
            _ => 2 * self.num_emb + self.head_size * self.num_emb,
        }
    }

    /// Floats per slot
    pub fn len(&self) -> usize {
        self.num_layer * self.layer_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh state of one slot
    pub fn init(&self) -> Vec<f32> {
        let mut state = vec![0.0; self.len()];
        if self.version == ModelVersion::V4 {
            let c = self.num_emb;
            for layer in state.chunks_mut(self.layer_len()) {
                layer[3 * c..4 * c].fill(V4_PP_INIT);
            }
        }
        state
    }
}

/// States of all slots of a runtime
#[derive(Debug, Clone)]
pub struct BatchState {
    layout: StateLayout,
    slots: Vec<Vec<f32>>,
}

impl BatchState {
    pub fn new(layout: StateLayout, num_batch: usize) -> Self {
        let slots = (0..num_batch).map(|_| layout.init()).collect();
        Self { layout, slots }
    }

    pub fn num_batch(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, batch: usize) -> Result<()> {
        if batch >= self.slots.len() {
            return Err(Error::IndexOutOfRange { index: batch, bound: self.slots.len() });
        }
        Ok(())
    }

    /// Reset one slot to the initial state.
    pub fn clear(&mut self, batch: usize) -> Result<()> {
        self.check(batch)?;
        self.slots[batch] = self.layout.init();
        Ok(())
    }

    /// Snapshot of one slot
    pub fn get(&self, batch: usize) -> Result<&[f32]> {
        self.check(batch)?;
        Ok(&self.slots[batch])
    }

    /// Overwrite one slot; the slot is untouched on error.
    pub fn set(&mut self, batch: usize, data: &[f32]) -> Result<()> {
        self.check(batch)?;
        if data.len() != self.layout.len() {
            return Err(Error::SizeMismatch { expected: self.layout.len(), actual: data.len() });
        }
        self.slots[batch].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: ModelVersion) -> ModelInfo {
        ModelInfo { version, num_layer: 2, num_emb: 8, num_hidden: 32, num_vocab: 16, num_head: 2 }
    }

    #[test]
    fn test_layout_lengths() {
        assert_eq!(StateLayout::new(&info(ModelVersion::V4)).len(), 2 * 5 * 8);
        // head_size 4: att_x 8 + kv 4 * 8 + ffn_x 8
        assert_eq!(StateLayout::new(&info(ModelVersion::V7)).len(), 2 * 48);
    }

    #[test]
    fn test_v4_init() {
        let state = StateLayout::new(&info(ModelVersion::V4)).init();
        assert!(state[..24].iter().all(|&x| x == 0.0));
        assert!(state[24..32].iter().all(|&x| x == V4_PP_INIT));
        assert!(state[64..72].iter().all(|&x| x == V4_PP_INIT));
    }

    #[test]
    fn test_batch_state_access() {
        let layout = StateLayout::new(&info(ModelVersion::V6));
        let mut state = BatchState::new(layout, 2);
        let data = vec![1.0; layout.len()];

        state.set(1, &data).unwrap();
        assert_eq!(state.get(1).unwrap(), data.as_slice());
        assert!(matches!(state.set(1, &data[1..]), Err(Error::SizeMismatch { .. })));
        assert_eq!(state.get(1).unwrap(), data.as_slice());
        assert!(matches!(state.get(2), Err(Error::IndexOutOfRange { index: 2, bound: 2 })));

        state.clear(1).unwrap();
        assert!(state.get(1).unwrap().iter().all(|&x| x == 0.0));
    }
}
