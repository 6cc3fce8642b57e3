use crate::inference::{self, InferInput, InferInputBatch, InferOption, DEFAULT_TOKEN_CHUNK_SIZE};
use crate::model::weights::{quant_map, Checkpoint};
use crate::model::{hooks, Model};
use crate::prefab;
use crate::state::BatchState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use web_rwkv_ffi_core::error::{Error, Result};
use web_rwkv_ffi_core::{Loader, ModelInfo};

/// Environment variable holding a JSON [`RuntimeConfig`], read by `init`
pub const CONFIG_ENV: &str = "WEB_RWKV_FFI_CONFIG";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tokens consumed per slot per inference step
    pub token_chunk_size: usize,
    /// Number of threads to use (0 = auto-detect)
    pub num_threads: usize,
    /// Log level of this library's modules
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { token_chunk_size: DEFAULT_TOKEN_CHUNK_SIZE, num_threads: 0, log_level: "info".into() }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.token_chunk_size == 0 {
            return Err(Error::InvalidArgument("token_chunk_size must be positive".into()));
        }
        Ok(config)
    }

    /// Configuration from [`CONFIG_ENV`], or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

/// How a checkpoint is turned into a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Layers whose matrices are quantized to Int8
    pub quant: usize,
    /// Layers whose matrices are quantized to NF4
    pub quant_nf4: usize,
    /// Layers whose matrices are quantized to SF4
    pub quant_sf4: usize,
    /// Halve the residual stream every this many layers
    pub rescale: Option<usize>,
    /// Install the extended time-mix hooks
    pub extended: bool,
    /// Store unquantized matrices as f16
    pub fp16: bool,
    /// Number of state slots
    pub batch: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { quant: 0, quant_nf4: 0, quant_sf4: 0, rescale: None, extended: false, fp16: false, batch: 1 }
    }
}

impl LoadOptions {
    pub fn with_quant(mut self, quant: usize, quant_nf4: usize, quant_sf4: usize) -> Self {
        self.quant = quant;
        self.quant_nf4 = quant_nf4;
        self.quant_sf4 = quant_sf4;
        self
    }

    pub fn with_rescale(mut self, rescale: usize) -> Self {
        self.rescale = Some(rescale);
        self
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn with_fp16(mut self, fp16: bool) -> Self {
        self.fp16 = fp16;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    /// Fix up degenerate values, warning about each.
    pub(crate) fn normalized(&self) -> Self {
        let mut options = self.clone();
        if options.batch == 0 {
            log::warn!("batch size 0 requested, using 1");
            options.batch = 1;
        }
        if options.rescale == Some(0) {
            log::warn!("rescale interval 0 requested, rescaling disabled");
            options.rescale = None;
        }
        options
    }
}

/// A loaded model with its batch of recurrent states
pub struct Runtime {
    model: Model,
    state: BatchState,
    token_chunk_size: usize,
}

impl Runtime {
    pub fn new(model: Model, batch: usize) -> Self {
        let state = BatchState::new(model.state_layout(), batch.max(1));
        Self { model, state, token_chunk_size: DEFAULT_TOKEN_CHUNK_SIZE }
    }

    /// Load a safetensors checkpoint.
    pub fn load(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Self> {
        let options = options.normalized();
        let loader = Loader::open(path)?;
        let info = loader.info_from_layout()?;
        log::info!("{info:#?}");

        let hooks = match options.extended {
            true => hooks::extended(&info),
            false => hooks::HookMap::new(),
        };
        let quant = quant_map(options.quant, options.quant_nf4, options.quant_sf4);
        let source = Checkpoint::new(loader, quant, options.rescale, options.fp16);
        let model = Model::build(&source, options.rescale, hooks)?;
        Ok(Self::new(model, options.batch))
    }

    /// Load a prefab written by [`prefab::convert`].
    pub fn load_prefab(path: impl AsRef<Path>, fp16: bool, batch: usize) -> Result<Self> {
        let options = LoadOptions::default().with_batch(batch).normalized();
        let source = prefab::Prefab::open(path, fp16)?;
        log::info!("{:#?}", source.header().info);

        let model = Model::build(&source, source.header().rescale, hooks::HookMap::new())?;
        Ok(Self::new(model, options.batch))
    }

    pub fn with_token_chunk_size(mut self, token_chunk_size: usize) -> Self {
        self.token_chunk_size = token_chunk_size.max(1);
        self
    }

    pub fn info(&self) -> &ModelInfo {
        self.model.info()
    }

    pub fn num_batch(&self) -> usize {
        self.state.num_batch()
    }

    pub fn clear_state(&mut self, batch: usize) -> Result<()> {
        self.state.clear(batch)
    }

    /// Copy of one slot's state
    pub fn state(&self, batch: usize) -> Result<Vec<f32>> {
        Ok(self.state.get(batch)?.to_vec())
    }

    pub fn load_state(&mut self, batch: usize, data: &[f32]) -> Result<()> {
        self.state.set(batch, data)
    }

    /// Run an input to completion; output `i` belongs to `input.batches[i]`.
    pub fn infer(&mut self, input: InferInput) -> Result<Vec<Vec<f32>>> {
        inference::run(&self.model, &mut self.state, input)
    }

    /// Feed `tokens` to every listed slot in order (slot `i` gets `batches[i]`).
    pub fn infer_batch(&mut self, batches: Vec<Vec<u32>>, option: InferOption) -> Result<Vec<Vec<f32>>> {
        let batches = batches.into_iter().map(|tokens| InferInputBatch { tokens, option }).collect();
        self.infer(InferInput::new(batches, self.token_chunk_size))
    }

    /// Logits after the last token, using slot 0
    pub fn infer_last(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        self.infer_single(tokens, InferOption::Last)
    }

    /// Logits of every position, using slot 0
    pub fn infer_full(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        self.infer_single(tokens, InferOption::Full)
    }

    fn infer_single(&mut self, tokens: &[u32], option: InferOption) -> Result<Vec<f32>> {
        let mut outputs = self.infer_batch(vec![tokens.to_vec()], option)?;
        Ok(outputs.pop().unwrap_or_default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("model", &self.model)
            .field("num_batch", &self.num_batch())
            .field("token_chunk_size", &self.token_chunk_size)
            .finish()
    }
}
