/// Layout detection and quantization over a checkpoint written to disk
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::path::{Path, PathBuf};
use web_rwkv_ffi_core::quant::{self, Quant, FP4_BLOCK_SIZE, INT8_BLOCK_SIZE};
use web_rwkv_ffi_core::{Error, Loader, ModelVersion};

const EMB: usize = 8;
const VOCAB: usize = 10;
const HIDDEN: usize = 24;

fn bf16_bytes(len: usize) -> Vec<u8> {
    (0..len).flat_map(|i| half::bf16::from_f32((i % 7) as f32 * 0.25 - 0.5).to_le_bytes()).collect()
}

/// A two-layer v5 layout with bf16 weights (only the tensors detection reads)
fn write_v5(dir: &Path) -> PathBuf {
    let mut tensors: Vec<(String, Vec<usize>)> = vec![("emb.weight".into(), vec![VOCAB, EMB])];
    for layer in 0..2 {
        tensors.push((format!("blocks.{layer}.ln1.weight"), vec![EMB]));
        tensors.push((format!("blocks.{layer}.att.ln_x.weight"), vec![EMB]));
        tensors.push((format!("blocks.{layer}.att.time_faaaa"), vec![2, EMB / 2, 1]));
        tensors.push((format!("blocks.{layer}.ffn.key.weight"), vec![HIDDEN, EMB]));
    }

    let data: Vec<Vec<u8>> = tensors.iter().map(|(_, shape)| bf16_bytes(shape.iter().product())).collect();
    let views = tensors
        .iter()
        .zip(&data)
        .map(|((name, shape), bytes)| (name.as_str(), TensorView::new(Dtype::BF16, shape.clone(), bytes).unwrap()))
        .collect::<Vec<_>>();

    let path = dir.join("v5.st");
    safetensors::serialize_to_file(views, &None, &path).unwrap();
    path
}

#[test]
fn test_detect_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Loader::open(write_v5(dir.path())).unwrap();
    let info = loader.info_from_layout().unwrap();

    assert_eq!(info.version, ModelVersion::V5);
    assert_eq!((info.num_layer, info.num_emb, info.num_vocab), (2, EMB, VOCAB));
    assert_eq!(info.num_hidden, HIDDEN);
    assert_eq!((info.num_head, info.head_size()), (2, EMB / 2));

    let emb = loader.tensor("emb.weight").unwrap();
    assert_eq!(emb.shape.dims(), &[VOCAB, EMB]);
    assert_eq!(emb.row(0).unwrap()[..3], [-0.5, -0.25, 0.0]);
}

#[test]
fn test_not_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.st");
    std::fs::write(&path, [0xFFu8; 64]).unwrap();
    assert!(matches!(Loader::open(&path), Err(Error::Safetensors(_))));
}

#[test]
fn test_quantized_rows_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Loader::open(write_v5(dir.path())).unwrap();
    let weight = loader.tensor("blocks.1.ffn.key.weight").unwrap();
    let (rows, cols) = weight.shape.matrix().unwrap();

    for kind in [Quant::NF4, Quant::SF4] {
        let codebook = kind.codebook().unwrap();
        let mut restored = vec![0.0; cols];
        for row in 0..rows {
            let source = weight.row(row).unwrap();
            let (mut codes, mut absmax) = (vec![], vec![]);
            quant::quantize_fp4_row(source, codebook, &mut codes, &mut absmax);
            assert_eq!(absmax.len(), quant::num_blocks(cols, FP4_BLOCK_SIZE));

            quant::dequantize_fp4_row(&codes, &absmax, codebook, &mut restored).unwrap();
            let amax = absmax.iter().copied().fold(0.0, f32::max);
            assert!(source.iter().zip(&restored).all(|(a, b)| (a - b).abs() <= 0.25 * amax), "{kind:?}");
        }
    }

    let (mut codes, mut mins, mut scales) = (vec![], vec![], vec![]);
    quant::quantize_int8_row(&weight.data, &mut codes, &mut mins, &mut scales);
    assert_eq!(mins.len(), quant::num_blocks(weight.len(), INT8_BLOCK_SIZE));
    let mut restored = vec![0.0; weight.len()];
    quant::dequantize_int8_row(&codes, &mins, &scales, &mut restored).unwrap();
    assert!(weight.data.iter().zip(&restored).all(|(a, b)| (a - b).abs() < 1e-2));
}
