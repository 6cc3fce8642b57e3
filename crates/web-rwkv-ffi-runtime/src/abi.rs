/// C ABI exports for the web-rwkv-ffi runtime
///
/// Every documented export keeps its value-returning signature and stays silent on
/// failure: errors are logged, stored in the thread's last-error slot and replaced
/// by a neutral value (0, a null buffer, zeroed info).
use crate::buffer;
use crate::context::{LoadOptions, Runtime, RuntimeConfig};
use crate::inference::InferOption;
use crate::sampling::{self, Sampler};
use crate::{clear_last_error, last_error_code_value, set_last_error, take_last_error};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::slice;
use std::sync::Once;
use web_rwkv_ffi_core::{Error, Result};
use web_rwkv_ffi_cpu::CpuBackend;

// Process-global runtime, replaced wholesale by every successful load
static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);
static CONFIG: Mutex<Option<RuntimeConfig>> = Mutex::new(None);
static LOGGER: Once = Once::new();

/// Logits of one sequence
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModelOutput {
    pub len: usize,
    pub logits: *mut f32,
}

impl Default for ModelOutput {
    fn default() -> Self {
        Self { len: 0, logits: std::ptr::null_mut() }
    }
}

/// Logits of `batch` sequences, `batch × len` row-major
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModelOutputBatch {
    pub batch: usize,
    pub len: usize,
    pub logits: *mut f32,
}

impl Default for ModelOutputBatch {
    fn default() -> Self {
        Self { batch: 0, len: 0, logits: std::ptr::null_mut() }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelInfoOutput {
    pub version: usize,
    pub num_layer: usize,
    pub num_hidden: usize,
    pub num_emb: usize,
    pub num_vocab: usize,
    pub num_head: usize,
}

/// Snapshot of one state slot
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StateRaw {
    pub len: usize,
    pub state: *mut f32,
}

impl Default for StateRaw {
    fn default() -> Self {
        Self { len: 0, state: std::ptr::null_mut() }
    }
}

/// Run `f`, turning an error into the thread's last error and a neutral value.
fn guard<T: Default>(f: impl FnOnce() -> Result<T>) -> T {
    clear_last_error();
    match f() {
        Ok(value) => value,
        Err(err) => {
            set_last_error(&err);
            T::default()
        }
    }
}

fn with_runtime<T>(f: impl FnOnce(&mut Runtime) -> Result<T>) -> Result<T> {
    let mut runtime = RUNTIME.lock();
    f(runtime.as_mut().ok_or(Error::NotLoaded)?)
}

fn token_chunk_size() -> usize {
    CONFIG.lock().get_or_insert_with(RuntimeConfig::default).token_chunk_size
}

/// Swap in a runtime built outside the lock; the old one survives a failed build.
fn install(build: impl FnOnce() -> Result<Runtime>) {
    guard(|| {
        let runtime = build()?.with_token_chunk_size(token_chunk_size());
        log::info!("runtime ready with {} state slots", runtime.num_batch());
        if RUNTIME.lock().replace(runtime).is_some() {
            log::debug!("previous runtime discarded");
        }
        Ok(())
    })
}

unsafe fn model_path(model: *const c_char) -> Result<PathBuf> {
    if model.is_null() {
        return Err(Error::InvalidPath("null model path".into()));
    }
    let path = CStr::from_ptr(model).to_str().map_err(|e| Error::InvalidPath(format!("not UTF-8: {e}")))?;
    Ok(PathBuf::from(path))
}

unsafe fn token_slice<'a>(tokens: *const u32, len: usize) -> Result<&'a [u32]> {
    if tokens.is_null() || len == 0 {
        return Err(Error::InvalidArgument("empty token sequence".into()));
    }
    Ok(slice::from_raw_parts(tokens, len))
}

unsafe fn token_batches(tokens: *const *const u32, lens: *const usize, batch: usize) -> Result<Vec<Vec<u32>>> {
    if tokens.is_null() || lens.is_null() || batch == 0 {
        return Err(Error::InvalidArgument("empty batch".into()));
    }
    let pointers = slice::from_raw_parts(tokens, batch);
    let lens = slice::from_raw_parts(lens, batch);
    pointers
        .iter()
        .zip(lens)
        .map(|(&tokens, &len)| token_slice(tokens, len).map(<[u32]>::to_vec))
        .collect()
}

fn export_batch(rows: Vec<Vec<f32>>) -> ModelOutputBatch {
    let batch = rows.len();
    let len = rows.first().map_or(0, Vec::len);
    let (logits, _) = buffer::export(rows.concat());
    ModelOutputBatch { batch, len, logits }
}

/// Set up logging, configuration and the RNG. Safe to call again; later calls only reseed.
#[no_mangle]
pub extern "C" fn init(seed: u64) {
    let config = RuntimeConfig::from_env();

    LOGGER.call_once(|| {
        let level = config.as_ref().map_or(log::LevelFilter::Info, RuntimeConfig::level_filter);
        // A host may already own the global logger
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .with_module_level("web_rwkv_ffi", level)
            .init();
    });

    guard(|| {
        let config = config?;
        if let Err(err) = CpuBackend::new().with_threads(config.num_threads).init() {
            log::warn!("{err}");
        }
        log::debug!("{config:?}");
        *CONFIG.lock() = Some(config);
        Ok(())
    });

    sampling::seed(seed);
}

/// Reseed the RNG without touching the runtime.
#[no_mangle]
pub extern "C" fn seed(seed: u64) {
    sampling::seed(seed);
}

/// Load a safetensors checkpoint.
///
/// # Safety
/// `model` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load(
    model: *const c_char,
    quant: usize,
    quant_nf4: usize,
    quant_sf4: usize,
    fp16: bool,
    batch: usize,
) {
    let options =
        LoadOptions::default().with_quant(quant, quant_nf4, quant_sf4).with_fp16(fp16).with_batch(batch);
    install(|| Runtime::load(model_path(model)?, &options));
}

/// Load a prefab produced by `convert_prefab`.
///
/// # Safety
/// `model` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load_prefab(model: *const c_char, fp16: bool, batch: usize) {
    install(|| Runtime::load_prefab(model_path(model)?, fp16, batch));
}

/// Like [`load`], with the extended time-mix hooks installed.
///
/// # Safety
/// `model` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load_extended(
    model: *const c_char,
    quant: usize,
    quant_nf4: usize,
    quant_sf4: usize,
    fp16: bool,
    batch: usize,
) {
    let options = LoadOptions::default()
        .with_quant(quant, quant_nf4, quant_sf4)
        .with_fp16(fp16)
        .with_batch(batch)
        .with_extended(true);
    install(|| Runtime::load(model_path(model)?, &options));
}

/// Like [`load`], halving the residual stream every `rescale` layers.
///
/// # Safety
/// `model` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load_with_rescale(
    model: *const c_char,
    quant: usize,
    quant_nf4: usize,
    quant_sf4: usize,
    rescale: usize,
    fp16: bool,
    batch: usize,
) {
    let options = LoadOptions::default()
        .with_quant(quant, quant_nf4, quant_sf4)
        .with_rescale(rescale)
        .with_fp16(fp16)
        .with_batch(batch);
    install(|| Runtime::load(model_path(model)?, &options));
}

/// Drop the runtime.
#[no_mangle]
pub extern "C" fn release() {
    clear_last_error();
    if RUNTIME.lock().take().is_some() {
        log::info!("runtime released");
    }
}

/// Reset one state slot.
#[no_mangle]
pub extern "C" fn clear_state(batch: usize) {
    guard(|| with_runtime(|runtime| runtime.clear_state(batch)));
}

/// Feed `tokens` to slot 0 and sample the next token.
///
/// # Safety
/// `tokens` must be valid for reads of `len` values.
#[no_mangle]
pub unsafe extern "C" fn infer(tokens: *const u32, len: usize, sampler: Sampler) -> u32 {
    guard(|| {
        let tokens = token_slice(tokens, len)?;
        let logits = with_runtime(|runtime| runtime.infer_last(tokens))?;
        sampling::with_rng(|rng| sampler.sample(&logits, rng))
    })
}

/// Release a [`ModelOutput`].
#[no_mangle]
pub extern "C" fn free_raw(output: ModelOutput) {
    guard(|| unsafe { buffer::release(output.logits, output.len) });
}

/// Release a [`ModelOutputBatch`].
#[no_mangle]
pub extern "C" fn free_raw_batch(output: ModelOutputBatch) {
    guard(|| {
        let len = output.batch.checked_mul(output.len).ok_or(Error::SizeMismatch {
            expected: usize::MAX / output.len.max(1),
            actual: output.batch,
        })?;
        unsafe { buffer::release(output.logits, len) }
    });
}

/// Logits after the last token of `tokens`, using slot 0.
///
/// # Safety
/// `tokens` must be valid for reads of `len` values.
#[no_mangle]
pub unsafe extern "C" fn infer_raw_last(tokens: *const u32, len: usize) -> ModelOutput {
    guard(|| {
        let tokens = token_slice(tokens, len)?;
        let (logits, len) = buffer::export(with_runtime(|runtime| runtime.infer_last(tokens))?);
        Ok(ModelOutput { len, logits })
    })
}

/// Logits of every position of `tokens`, using slot 0.
///
/// # Safety
/// `tokens` must be valid for reads of `len` values.
#[no_mangle]
pub unsafe extern "C" fn infer_raw_all(tokens: *const u32, len: usize) -> ModelOutput {
    guard(|| {
        let tokens = token_slice(tokens, len)?;
        let (logits, len) = buffer::export(with_runtime(|runtime| runtime.infer_full(tokens))?);
        Ok(ModelOutput { len, logits })
    })
}

/// Last-token logits of `batch` sequences; sequence `i` runs on slot `i`.
///
/// # Safety
/// `tokens` and `lens` must be valid for reads of `batch` values, and each
/// `tokens[i]` for reads of `lens[i]` values.
#[no_mangle]
pub unsafe extern "C" fn infer_raw_last_batch(
    tokens: *const *const u32,
    lens: *const usize,
    batch: usize,
) -> ModelOutputBatch {
    guard(|| {
        let batches = token_batches(tokens, lens, batch)?;
        let rows = with_runtime(|runtime| runtime.infer_batch(batches, InferOption::Last))?;
        Ok(export_batch(rows))
    })
}

/// Logits of every position of `batch` equally long sequences.
///
/// # Safety
/// Same as [`infer_raw_last_batch`].
#[no_mangle]
pub unsafe extern "C" fn infer_raw_all_batch(
    tokens: *const *const u32,
    lens: *const usize,
    batch: usize,
) -> ModelOutputBatch {
    guard(|| {
        let batches = token_batches(tokens, lens, batch)?;
        let expected = batches[0].len();
        if let Some(other) = batches.iter().find(|tokens| tokens.len() != expected) {
            return Err(Error::SizeMismatch { expected, actual: other.len() });
        }
        let rows = with_runtime(|runtime| runtime.infer_batch(batches, InferOption::Full))?;
        Ok(export_batch(rows))
    })
}

/// Architecture of the loaded model; zeroed before any load.
#[no_mangle]
pub extern "C" fn get_model_info() -> ModelInfoOutput {
    guard(|| {
        with_runtime(|runtime| {
            let info = runtime.info();
            Ok(ModelInfoOutput {
                version: info.version.as_number(),
                num_layer: info.num_layer,
                num_hidden: info.num_hidden,
                num_emb: info.num_emb,
                num_vocab: info.num_vocab,
                num_head: info.num_head,
            })
        })
    })
}

/// Copy of one state slot, to be released with [`free_state`].
#[no_mangle]
pub extern "C" fn get_state(batch: usize) -> StateRaw {
    guard(|| {
        let (state, len) = buffer::export(with_runtime(|runtime| runtime.state(batch))?);
        Ok(StateRaw { len, state })
    })
}

/// Overwrite one state slot. The slot is left untouched on error.
///
/// # Safety
/// `state.state` must be null or valid for reads of `state.len` values.
#[no_mangle]
pub unsafe extern "C" fn set_state(state: StateRaw, batch: usize) {
    guard(|| {
        let data: &[f32] = match state.state.is_null() {
            true if state.len > 0 => return Err(Error::InvalidArgument("null state buffer".into())),
            true => &[],
            false => slice::from_raw_parts(state.state, state.len),
        };
        with_runtime(|runtime| runtime.load_state(batch, data))
    });
}

/// Release a [`StateRaw`].
#[no_mangle]
pub extern "C" fn free_state(state: StateRaw) {
    guard(|| unsafe { buffer::release(state.state, state.len) });
}

/// Code of the last failed call on this thread, 0 if it succeeded
#[no_mangle]
pub extern "C" fn last_error_code() -> u32 {
    last_error_code_value() as u32
}

/// Get last error message and clear it
///
/// Returns number of bytes written to buffer.
///
/// # Safety
/// `buf_ptr` must be valid for writes of `buf_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn last_error(buf_ptr: *mut c_char, buf_len: usize) -> usize {
    if buf_ptr.is_null() || buf_len == 0 {
        return 0;
    }

    let error_msg = take_last_error().unwrap_or_else(|| "No error".to_string());
    let bytes = error_msg.as_bytes();
    let copy_len = bytes.len().min(buf_len - 1);

    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf_ptr as *mut u8, copy_len);
    *buf_ptr.add(copy_len) = 0;

    copy_len
}

/// Get runtime version string
#[no_mangle]
pub extern "C" fn version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{self, SyntheticConfig};
    use crate::ErrorCode;
    use serial_test::serial;
    use std::ffi::CString;
    use web_rwkv_ffi_core::ModelVersion;

    #[test]
    fn test_version() {
        let ver_ptr = version();
        assert!(!ver_ptr.is_null());

        let c_str = unsafe { CStr::from_ptr(ver_ptr) };
        assert_eq!(c_str.to_str().unwrap(), crate::VERSION);
    }

    #[test]
    #[serial]
    fn test_unloaded_is_neutral() {
        release();
        assert_eq!(get_model_info(), ModelInfoOutput::default());
        assert_eq!(last_error_code(), ErrorCode::NotLoaded as u32);

        let tokens = [1u32, 2];
        let output = unsafe { infer_raw_last(tokens.as_ptr(), tokens.len()) };
        assert!(output.logits.is_null());
        assert_eq!(output.len, 0);
        assert_eq!(unsafe { infer(tokens.as_ptr(), tokens.len(), Sampler::default()) }, 0);
        assert_eq!(last_error_code(), ErrorCode::NotLoaded as u32);

        let mut buf = [0 as c_char; 64];
        let written = unsafe { last_error(buf.as_mut_ptr(), buf.len()) };
        let message = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(written, message.to_bytes().len());
        assert_eq!(message.to_str().unwrap(), "Runtime not loaded");
        assert_eq!(last_error_code(), ErrorCode::Ok as u32);
    }

    #[test]
    #[serial]
    fn test_bad_path_keeps_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.st");
        synthetic::write(&SyntheticConfig::tiny(ModelVersion::V5), &path).unwrap();

        let model = CString::new(path.to_str().unwrap()).unwrap();
        unsafe { load(model.as_ptr(), 0, 0, 0, false, 1) };
        assert_eq!(last_error_code(), ErrorCode::Ok as u32);
        assert_eq!(get_model_info().version, 5);

        let missing = CString::new(dir.path().join("missing.st").to_str().unwrap()).unwrap();
        unsafe { load(missing.as_ptr(), 0, 0, 0, false, 1) };
        assert_eq!(last_error_code(), ErrorCode::InvalidPath as u32);
        unsafe { load(std::ptr::null(), 0, 0, 0, false, 1) };
        assert_eq!(last_error_code(), ErrorCode::InvalidPath as u32);
        assert_eq!(get_model_info().version, 5);

        release();
        assert_eq!(get_model_info().version, 0);
    }

    #[test]
    #[serial]
    fn test_free_raw_batch_overflowing_size() {
        let live = crate::live_buffers();
        let output = ModelOutputBatch { batch: usize::MAX, len: 2, logits: std::ptr::NonNull::dangling().as_ptr() };
        free_raw_batch(output);
        assert_eq!(last_error_code(), ErrorCode::SizeMismatch as u32);
        assert_eq!(crate::live_buffers(), live);
    }
}
