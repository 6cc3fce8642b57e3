use thiserror::Error;

/// Core error types for web-rwkv-ffi
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid model path: {0}")]
    InvalidPath(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailure(String),

    #[error("Index out of range: {index} >= {bound}")]
    IndexOutOfRange { index: usize, bound: usize },

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Runtime not loaded")]
    NotLoaded,

    #[error("Buffer {0:#x} was already freed or not allocated by this library")]
    DoubleFree(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a missing checkpoint tensor.
    pub fn missing_tensor(name: &str) -> Self {
        Error::ModelLoadFailure(format!("missing tensor `{name}`"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
