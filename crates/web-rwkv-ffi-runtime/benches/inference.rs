use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use web_rwkv_ffi::synthetic::{self, SyntheticConfig};
use web_rwkv_ffi::{InferOption, LoadOptions, ModelVersion, Runtime};

fn bench_prompt(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("prompt");
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    let tokens: Vec<u32> = (0..64).map(|i| (i * 7) % 256).collect();

    for version in [ModelVersion::V4, ModelVersion::V5, ModelVersion::V6, ModelVersion::V7] {
        let config = SyntheticConfig {
            num_layer: 4,
            num_emb: 256,
            num_hidden: 896,
            num_vocab: 256,
            num_head: if version == ModelVersion::V4 { 1 } else { 4 },
            ..SyntheticConfig::tiny(version)
        };
        let path = dir.path().join(format!("{version}.st"));
        synthetic::write(&config, &path).unwrap();
        let mut runtime = Runtime::load(&path, &LoadOptions::default()).unwrap();

        group.throughput(Throughput::Elements(tokens.len() as u64));
        group.bench_with_input(BenchmarkId::new("last", version), &tokens, |bencher, tokens| {
            bencher.iter(|| {
                runtime.clear_state(0).unwrap();
                runtime.infer_last(black_box(tokens)).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_quantized_batch(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("batch");
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    let config = SyntheticConfig { num_emb: 256, num_hidden: 896, num_vocab: 256, num_head: 4, ..SyntheticConfig::tiny(ModelVersion::V7) };
    let path = dir.path().join("v7.st");
    synthetic::write(&config, &path).unwrap();

    for (name, options) in [
        ("f32", LoadOptions::default()),
        ("int8", LoadOptions::default().with_quant(2, 0, 0)),
        ("nf4", LoadOptions::default().with_quant(0, 2, 0)),
    ] {
        let mut runtime = Runtime::load(&path, &options.with_batch(4)).unwrap();
        let batches: Vec<Vec<u32>> = (0..4).map(|slot| (0..16).map(|i| (slot * 31 + i) % 256).collect()).collect();

        group.throughput(Throughput::Elements(64));
        group.bench_function(name, |bencher| {
            bencher.iter(|| runtime.infer_batch(black_box(batches.clone()), InferOption::Last).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_prompt, bench_quantized_batch);
criterion_main!(benches);
