//! Core primitives for web-rwkv-ffi
//!
//! This crate provides the building blocks shared by the CPU kernels and the runtime:
//! - Error taxonomy
//! - Model metadata and version detection
//! - Memory-mapped safetensors checkpoint reading
//! - Int8 / NF4 / SF4 quantization primitives

pub mod error;
pub mod info;
pub mod loader;
pub mod quant;
pub mod tensor;

pub use error::{Error, Result};
pub use info::{ModelInfo, ModelVersion};
pub use loader::Loader;
pub use quant::Quant;
pub use tensor::{DataType, Shape, Tensor};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
