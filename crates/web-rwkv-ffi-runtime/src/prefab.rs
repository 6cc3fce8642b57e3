//! Prefab: a checkpoint saved after load-time conversion
//!
//! A prefab is a regular safetensors file. Linear matrices are stored in their
//! runtime form (f32, f16, Int8 codes with `.min` / `.scale` side tensors, or
//! packed 4-bit codes with an `.absmax` side tensor); everything else is f32.
//! The `__metadata__` entry [`PREFAB_KEY`] holds a JSON [`PrefabHeader`].

use crate::context::LoadOptions;
use crate::model::weights::{matrix_plan, quant_map, Checkpoint, QuantMap, WeightSource};
use half::f16;
use safetensors::tensor::TensorView;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use web_rwkv_ffi_core::loader::decode_f32;
use web_rwkv_ffi_core::{DataType, Error, Loader, ModelInfo, Quant, Result, Tensor};
use web_rwkv_ffi_cpu::{Matrix, Storage};

/// Metadata key of the prefab header
pub const PREFAB_KEY: &str = "web_rwkv_ffi.prefab";

/// Conversion record stored alongside the weights
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefabHeader {
    pub info: ModelInfo,
    /// Rescale interval already applied to the output projections
    pub rescale: Option<usize>,
    /// Per-layer quantization
    pub quant: QuantMap,
    /// `[rows, cols]` of matrices stored as packed bytes
    pub matrices: BTreeMap<String, [usize; 2]>,
}

/// One tensor ready to be written
struct Entry {
    name: String,
    dtype: DataType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Entry {
    fn f32(name: String, shape: Vec<usize>, data: &[f32]) -> Self {
        Self { name, dtype: DataType::F32, shape, bytes: bytemuck::cast_slice(data).to_vec() }
    }
}

fn encode_matrix(name: &str, matrix: &Matrix, header: &mut PrefabHeader) -> Vec<Entry> {
    let (rows, cols) = (matrix.rows(), matrix.cols());
    match matrix.storage() {
        Storage::F32(data) => vec![Entry::f32(name.into(), vec![rows, cols], data)],
        Storage::F16(data) => vec![Entry {
            name: name.into(),
            dtype: DataType::F16,
            shape: vec![rows, cols],
            bytes: bytemuck::cast_slice(data).to_vec(),
        }],
        Storage::Int8 { codes, mins, scales } => {
            header.matrices.insert(name.into(), [rows, cols]);
            let blocks = mins.len() / rows.max(1);
            vec![
                Entry { name: name.into(), dtype: DataType::U8, shape: vec![codes.len()], bytes: codes.clone() },
                Entry::f32(format!("{name}.min"), vec![rows, blocks], mins),
                Entry::f32(format!("{name}.scale"), vec![rows, blocks], scales),
            ]
        }
        Storage::Fp4 { codes, absmax, .. } => {
            header.matrices.insert(name.into(), [rows, cols]);
            let blocks = absmax.len() / rows.max(1);
            vec![
                Entry { name: name.into(), dtype: DataType::U8, shape: vec![codes.len()], bytes: codes.clone() },
                Entry::f32(format!("{name}.absmax"), vec![rows, blocks], absmax),
            ]
        }
    }
}

/// Convert the checkpoint at `src` with `options` and save it as a prefab at `dst`.
///
/// `options.extended` and `options.batch` are runtime choices and are not recorded.
pub fn convert(src: impl AsRef<Path>, dst: impl AsRef<Path>, options: &LoadOptions) -> Result<PrefabHeader> {
    let options = options.normalized();
    let quant = quant_map(options.quant, options.quant_nf4, options.quant_sf4);
    let source = Checkpoint::new(Loader::open(src)?, quant.clone(), options.rescale, options.fp16);

    let mut header =
        PrefabHeader { info: source.info()?, rescale: options.rescale, quant, matrices: BTreeMap::new() };

    let mut names = source.loader().tensor_names();
    names.sort();
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        if matrix_plan(&name).is_some() {
            let matrix = source.matrix(&name)?;
            entries.extend(encode_matrix(&name, &matrix, &mut header));
        } else {
            let tensor = source.tensor(&name)?;
            entries.push(Entry::f32(name, tensor.shape.0, &tensor.data));
        }
    }

    let views = entries
        .iter()
        .map(|entry| {
            let view = TensorView::new(entry.dtype.into(), entry.shape.clone(), &entry.bytes)?;
            Ok((entry.name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    let metadata = HashMap::from([(PREFAB_KEY.to_string(), serde_json::to_string(&header)?)]);
    safetensors::serialize_to_file(views, &Some(metadata), dst.as_ref())?;

    log::info!("wrote prefab with {} tensors to {}", entries.len(), dst.as_ref().display());
    Ok(header)
}

/// A prefab opened for model construction
pub struct Prefab {
    loader: Loader,
    header: PrefabHeader,
    fp16: bool,
}

impl Prefab {
    /// Open a prefab; `fp16` additionally converts f32 matrices to f16.
    pub fn open(path: impl AsRef<Path>, fp16: bool) -> Result<Self> {
        let loader = Loader::open(path)?;
        let header = loader
            .header()
            .and_then(|metadata| metadata.get(PREFAB_KEY))
            .ok_or_else(|| {
                Error::ModelLoadFailure(format!("{} is not a prefab", loader.path().display()))
            })?;
        let header: PrefabHeader = serde_json::from_str(header)?;
        Ok(Self { loader, header, fp16 })
    }

    pub fn header(&self) -> &PrefabHeader {
        &self.header
    }

    fn packed_shape(&self, name: &str) -> Result<(usize, usize)> {
        self.header
            .matrices
            .get(name)
            .map(|&[rows, cols]| (rows, cols))
            .ok_or_else(|| Error::ModelLoadFailure(format!("no shape recorded for packed `{name}`")))
    }

    fn fp4_quant(&self, name: &str) -> Result<Quant> {
        let quant = matrix_plan(name)
            .and_then(|plan| plan.layer)
            .and_then(|layer| self.header.quant.get(&layer))
            .copied()
            .unwrap_or_default();
        match quant {
            Quant::NF4 | Quant::SF4 => Ok(quant),
            other => Err(Error::ModelLoadFailure(format!("`{name}` has 4-bit codes but layer quant {other:?}"))),
        }
    }
}

impl WeightSource for Prefab {
    fn info(&self) -> Result<ModelInfo> {
        Ok(self.header.info)
    }

    fn contains(&self, name: &str) -> bool {
        self.loader.contains(name)
    }

    fn tensor(&self, name: &str) -> Result<Tensor> {
        self.loader.tensor(name)
    }

    fn matrix(&self, name: &str) -> Result<Matrix> {
        match self.loader.dtype(name)? {
            DataType::F32 | DataType::BF16 => {
                let tensor = self.loader.tensor(name)?;
                let (rows, cols) = tensor.shape.matrix()?;
                Matrix::quantize(rows, cols, tensor.data, Quant::None, self.fp16)
            }
            DataType::F16 => {
                let (rows, cols) = self.loader.shape(name).ok_or_else(|| Error::missing_tensor(name))?.matrix()?;
                let data = self
                    .loader
                    .bytes(name)?
                    .chunks_exact(2)
                    .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]))
                    .collect();
                Matrix::from_storage(rows, cols, Storage::F16(data))
            }
            DataType::U8 => {
                let (rows, cols) = self.packed_shape(name)?;
                let (_, codes) = self.loader.tensor_u8(name)?;
                let side = |suffix: &str| -> Result<Vec<f32>> {
                    let side = format!("{name}.{suffix}");
                    decode_f32(self.loader.dtype(&side)?, self.loader.bytes(&side)?)
                };
                let storage = match self.loader.contains(&format!("{name}.min")) {
                    true => Storage::Int8 { codes, mins: side("min")?, scales: side("scale")? },
                    false => Storage::Fp4 { quant: self.fp4_quant(name)?, codes, absmax: side("absmax")? },
                };
                Matrix::from_storage(rows, cols, storage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{self, SyntheticConfig};
    use web_rwkv_ffi_core::ModelVersion;

    #[test]
    fn test_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (src, dst) = (dir.path().join("model.st"), dir.path().join("model.prefab"));
        let config = SyntheticConfig::tiny(ModelVersion::V5);
        synthetic::write(&config, &src).unwrap();

        let options = LoadOptions::default().with_quant(1, 1, 0).with_rescale(1);
        let header = convert(&src, &dst, &options).unwrap();
        assert_eq!(header.info, config.info());
        assert_eq!(header.quant.get(&0), Some(&Quant::NF4));
        assert!(header.matrices.contains_key("blocks.0.att.key.weight"));
        assert!(!header.matrices.contains_key("blocks.1.att.key.weight"));

        let prefab = Prefab::open(&dst, false).unwrap();
        assert_eq!(prefab.header(), &header);
        assert_eq!(prefab.matrix("blocks.0.ffn.value.weight").unwrap().quant(), Quant::NF4);
        assert_eq!(prefab.matrix("blocks.1.ffn.value.weight").unwrap().quant(), Quant::None);
    }

    #[test]
    fn test_plain_checkpoint_is_not_prefab() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.st");
        synthetic::write(&SyntheticConfig::tiny(ModelVersion::V4), &path).unwrap();
        assert!(matches!(Prefab::open(&path, false), Err(Error::ModelLoadFailure(_))));
    }
}
