//! web-rwkv-ffi runtime with stable C ABI
//!
//! Loads RWKV checkpoints (v4 to v7) and exposes inference, sampling and state
//! transfer to native hosts. Rust callers can use [`Runtime`] directly as an
//! explicit handle instead of the process-global one behind the C surface.

mod abi;
pub mod buffer;
mod context;
pub mod inference;
pub mod model;
pub mod prefab;
pub mod sampling;
pub mod state;
pub mod synthetic;

pub use abi::*;
pub use buffer::live_buffers;
pub use context::{LoadOptions, Runtime, RuntimeConfig, CONFIG_ENV};
pub use inference::{InferInput, InferInputBatch, InferOption, InferOutput, InferOutputBatch};
pub use prefab::{convert as convert_prefab, PrefabHeader};
pub use sampling::Sampler;
pub use web_rwkv_ffi_core::{Error, ModelInfo, ModelVersion, Quant, Result};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error codes for C ABI
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    GenericFailure = 1,
    InvalidArgument = 3,
    ModelParseError = 4,
    IoError = 7,
    InvalidPath = 8,
    ModelLoadFailure = 9,
    IndexOutOfRange = 10,
    SizeMismatch = 11,
    NotLoaded = 12,
    DoubleFree = 13,
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidPath(_) => ErrorCode::InvalidPath,
            Error::ModelLoadFailure(_) => ErrorCode::ModelLoadFailure,
            Error::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
            Error::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            Error::NotLoaded => ErrorCode::NotLoaded,
            Error::DoubleFree(_) => ErrorCode::DoubleFree,
            Error::InvalidArgument(_) | Error::InvalidShape(_) | Error::UnsupportedDataType(_) => {
                ErrorCode::InvalidArgument
            }
            Error::Safetensors(_) | Error::Json(_) => ErrorCode::ModelParseError,
            Error::Io(_) => ErrorCode::IoError,
        }
    }
}

/// Thread-local error storage for C ABI
use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

/// Log `err` and remember it as this thread's last error.
pub(crate) fn set_last_error(err: &Error) {
    log::error!("{err}");
    LAST_ERROR.with(|e| *e.borrow_mut() = Some((ErrorCode::from(err), err.to_string())));
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

pub(crate) fn last_error_code_value() -> ErrorCode {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|(code, _)| *code).unwrap_or(ErrorCode::Ok))
}

pub(crate) fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take().map(|(_, message)| message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from(&Error::NotLoaded), ErrorCode::NotLoaded);
        assert_eq!(ErrorCode::from(&Error::DoubleFree(8)), ErrorCode::DoubleFree);
        assert_eq!(ErrorCode::from(&Error::InvalidShape("x".into())), ErrorCode::InvalidArgument);
        assert_eq!(ErrorCode::NotLoaded as u32, 12);
    }

    #[test]
    fn test_last_error_slot() {
        clear_last_error();
        assert_eq!(last_error_code_value(), ErrorCode::Ok);

        set_last_error(&Error::IndexOutOfRange { index: 3, bound: 1 });
        assert_eq!(last_error_code_value(), ErrorCode::IndexOutOfRange);
        assert_eq!(take_last_error().as_deref(), Some("Index out of range: 3 >= 1"));
        assert_eq!(last_error_code_value(), ErrorCode::Ok);
    }
}
