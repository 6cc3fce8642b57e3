//! Memory-mapped safetensors checkpoint reader
//!
//! The header is parsed once at open; tensor payloads are decoded lazily,
//! converting F16/BF16 to f32 on demand.

use crate::error::{Error, Result};
use crate::info::ModelInfo;
use crate::tensor::{DataType, Shape, Tensor};
use memmap2::Mmap;
use safetensors::tensor::{Metadata, TensorInfo};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Read-only view over a safetensors file
pub struct Loader {
    path: PathBuf,
    data: Mmap,
    header_len: usize,
    metadata: Metadata,
}

impl Loader {
    /// Memory-map and index a checkpoint.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::InvalidPath(path.display().to_string()));
        }

        let file = File::open(&path)?;
        // SAFETY: the mapping is read-only and lives as long as the loader; callers
        // must not truncate the checkpoint while it is being read.
        let data = unsafe { Mmap::map(&file)? };
        let (header_len, metadata) = SafeTensors::read_metadata(&data)?;

        log::debug!("indexed {} tensors from {}", metadata.tensors().len(), path.display());
        Ok(Self { path, data, header_len, metadata })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free-form `__metadata__` entries of the file header
    pub fn header(&self) -> Option<&HashMap<String, String>> {
        self.metadata.metadata().as_ref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metadata.info(name).is_some()
    }

    /// All tensor names in the file (unordered)
    pub fn tensor_names(&self) -> Vec<String> {
        self.metadata.tensors().into_keys().collect()
    }

    fn info(&self, name: &str) -> Result<&TensorInfo> {
        self.metadata.info(name).ok_or_else(|| Error::missing_tensor(name))
    }

    pub fn shape(&self, name: &str) -> Option<Shape> {
        self.metadata.info(name).map(|info| Shape::from(info.shape.as_slice()))
    }

    pub fn dtype(&self, name: &str) -> Result<DataType> {
        DataType::try_from(self.info(name)?.dtype)
    }

    /// Raw little-endian payload of a tensor
    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        let info = self.info(name)?;
        let (start, end) = info.data_offsets;
        let base = 8 + self.header_len;
        self.data
            .get(base + start..base + end)
            .ok_or_else(|| Error::ModelLoadFailure(format!("tensor `{name}` exceeds file bounds")))
    }

    /// Decode a floating point tensor into f32.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let info = self.info(name)?;
        let shape = Shape::from(info.shape.as_slice());
        let data = decode_f32(DataType::try_from(info.dtype)?, self.bytes(name)?)?;
        Tensor::new(shape, data)
    }

    /// Decode a U8 tensor (packed quantized blocks).
    pub fn tensor_u8(&self, name: &str) -> Result<(Shape, Vec<u8>)> {
        let info = self.info(name)?;
        match DataType::try_from(info.dtype)? {
            DataType::U8 => Ok((Shape::from(info.shape.as_slice()), self.bytes(name)?.to_vec())),
            other => Err(Error::UnsupportedDataType(format!("`{name}` is {other:?}, expected U8"))),
        }
    }

    /// Architecture metadata derived from the tensor layout
    pub fn info_from_layout(&self) -> Result<ModelInfo> {
        ModelInfo::detect(|name| self.shape(name))
    }
}

/// Convert a little-endian float payload to f32.
pub fn decode_f32(dtype: DataType, bytes: &[u8]) -> Result<Vec<f32>> {
    let data = match dtype {
        DataType::F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        DataType::F16 => bytes
            .chunks_exact(2)
            .map(|chunk| half::f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
            .collect(),
        DataType::BF16 => bytes
            .chunks_exact(2)
            .map(|chunk| half::bf16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
            .collect(),
        DataType::U8 => {
            return Err(Error::UnsupportedDataType("U8 payload cannot be read as float".into()))
        }
    };
    Ok(data)
}
