//! Chunked batch inference
//!
//! An [`InferInput`] holds one token queue per state slot. Each step consumes up
//! to `token_chunk_size` tokens from every queue, slots running in parallel, and
//! hands back the remaining input so callers can interleave their own work.

use crate::model::Model;
use crate::state::BatchState;
use rayon::prelude::*;
use web_rwkv_ffi_core::{Error, Result};

/// Default number of tokens consumed per slot per step
pub const DEFAULT_TOKEN_CHUNK_SIZE: usize = 128;

/// Which positions produce logits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferOption {
    /// Only the final token of the sequence
    #[default]
    Last,
    /// Every token, concatenated in order
    Full,
}

/// Token queue of one slot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferInputBatch {
    pub tokens: Vec<u32>,
    pub option: InferOption,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferInput {
    /// Entry `i` runs on state slot `i`
    pub batches: Vec<InferInputBatch>,
    pub token_chunk_size: usize,
}

impl InferInput {
    pub fn new(batches: Vec<InferInputBatch>, token_chunk_size: usize) -> Self {
        Self { batches, token_chunk_size }
    }

    /// True once every queue is drained
    pub fn is_done(&self) -> bool {
        self.batches.iter().all(|batch| batch.tokens.is_empty())
    }

    /// Reject inputs that would fail halfway through and leave slots partially advanced.
    pub fn validate(&self, model: &Model, num_batch: usize) -> Result<()> {
        if self.batches.is_empty() {
            return Err(Error::InvalidArgument("no sequences to infer".into()));
        }
        if self.batches.len() > num_batch {
            return Err(Error::IndexOutOfRange { index: self.batches.len() - 1, bound: num_batch });
        }
        for (index, batch) in self.batches.iter().enumerate() {
            if batch.tokens.is_empty() {
                return Err(Error::InvalidArgument(format!("sequence {index} is empty")));
            }
            batch.tokens.iter().try_for_each(|&token| model.check_token(token))?;
        }
        Ok(())
    }
}

/// Logits of one slot produced by a step (empty when nothing was requested)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferOutputBatch(pub Vec<f32>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferOutput(pub Vec<InferOutputBatch>);

/// Run one chunk of every queue.
pub fn step(model: &Model, state: &mut BatchState, mut input: InferInput) -> Result<(InferInput, InferOutput)> {
    let chunk = input.token_chunk_size.max(1);
    let outputs = input
        .batches
        .par_iter_mut()
        .zip(state.slots_mut().par_iter_mut())
        .map(|(batch, slot)| {
            let take = batch.tokens.len().min(chunk);
            let tokens: Vec<u32> = batch.tokens.drain(..take).collect();
            let finished = batch.tokens.is_empty();

            let mut output = Vec::new();
            for (index, &token) in tokens.iter().enumerate() {
                let logits = match batch.option {
                    InferOption::Full => true,
                    InferOption::Last => finished && index + 1 == tokens.len(),
                };
                if let Some(logits) = model.forward(token, slot, logits)? {
                    output.extend(logits);
                }
            }
            Ok(InferOutputBatch(output))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((input, InferOutput(outputs)))
}

/// Run `input` to completion, returning the logits of every queue.
pub fn run(model: &Model, state: &mut BatchState, input: InferInput) -> Result<Vec<Vec<f32>>> {
    input.validate(model, state.num_batch())?;

    let mut outputs = vec![Vec::new(); input.batches.len()];
    let mut input = input;
    loop {
        let (next, InferOutput(chunk)) = step(model, state, input)?;
        for (output, InferOutputBatch(logits)) in outputs.iter_mut().zip(chunk) {
            output.extend(logits);
        }
        if next.is_done() {
            break;
        }
        log::trace!("{} tokens left", next.batches.iter().map(|b| b.tokens.len()).sum::<usize>());
        input = next;
    }
    Ok(outputs)
}
