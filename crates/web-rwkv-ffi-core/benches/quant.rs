use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use web_rwkv_ffi_core::quant::{self, Quant};

fn row(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 2654435761) % 1000) as f32 / 500.0 - 1.0).collect()
}

fn bench_quantize(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("quantize_row");

    for len in [1024, 4096] {
        let data = row(len);
        group.throughput(Throughput::Elements(len as u64));

        group.bench_with_input(BenchmarkId::new("int8", len), &data, |bencher, data| {
            bencher.iter(|| {
                let (mut codes, mut mins, mut scales) = (vec![], vec![], vec![]);
                quant::quantize_int8_row(black_box(data), &mut codes, &mut mins, &mut scales);
                codes
            });
        });

        for kind in [Quant::NF4, Quant::SF4] {
            let Some(codebook) = kind.codebook() else { continue };
            group.bench_with_input(BenchmarkId::new(format!("{kind:?}"), len), &data, |bencher, data| {
                bencher.iter(|| {
                    let (mut codes, mut absmax) = (vec![], vec![]);
                    quant::quantize_fp4_row(black_box(data), codebook, &mut codes, &mut absmax);
                    codes
                });
            });
        }
    }

    group.finish();
}

fn bench_dequantize(criterion: &mut Criterion) {
    let data = row(4096);
    let mut output = vec![0.0; data.len()];

    let (mut codes, mut mins, mut scales) = (vec![], vec![], vec![]);
    quant::quantize_int8_row(&data, &mut codes, &mut mins, &mut scales);
    criterion.bench_function("dequantize_int8_4096", |bencher| {
        bencher.iter(|| quant::dequantize_int8_row(black_box(&codes), &mins, &scales, &mut output).unwrap());
    });

    let codebook = &quant::NF4_CODEBOOK;
    let (mut codes, mut absmax) = (vec![], vec![]);
    quant::quantize_fp4_row(&data, codebook, &mut codes, &mut absmax);
    criterion.bench_function("dequantize_nf4_4096", |bencher| {
        bencher.iter(|| quant::dequantize_fp4_row(black_box(&codes), &absmax, codebook, &mut output).unwrap());
    });
}

criterion_group!(benches, bench_quantize, bench_dequantize);
criterion_main!(benches);
