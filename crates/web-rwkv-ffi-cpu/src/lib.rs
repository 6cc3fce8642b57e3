//! CPU backend for web-rwkv-ffi
//!
//! Provides the kernels and quantized matrix storage the RWKV forward pass runs on.

pub mod kernels;
pub mod matrix;

pub use matrix::{vecmat, Matrix, Storage};

use web_rwkv_ffi_core::error::{Error, Result};

/// CPU backend configuration
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    /// Number of threads to use (0 = auto-detect)
    pub num_threads: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    /// Size the global rayon pool.
    ///
    /// The pool can only be built once per process; later calls with a different
    /// thread count report an error and leave the existing pool in place.
    pub fn init(&self) -> Result<()> {
        if self.num_threads == 0 || rayon::current_num_threads() == self.num_threads {
            return Ok(());
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build_global()
            .map_err(|e| Error::InvalidArgument(format!("thread pool: {e}")))
    }

    /// Threads the pool actually runs with
    pub fn threads(&self) -> usize {
        rayon::current_num_threads()
    }
}
