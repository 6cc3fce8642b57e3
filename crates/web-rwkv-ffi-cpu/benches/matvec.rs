use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use web_rwkv_ffi_core::Quant;
use web_rwkv_ffi_cpu::Matrix;

fn random(len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn bench_matvec(c: &mut Criterion) {
    let (rows, cols) = (1024, 1024);
    let data = random(rows * cols);
    let x = random(cols);
    let mut output = vec![0.0f32; rows];

    for (name, quant, fp16) in [
        ("matvec_1024_f32", Quant::None, false),
        ("matvec_1024_f16", Quant::None, true),
        ("matvec_1024_int8", Quant::Int8, false),
        ("matvec_1024_nf4", Quant::NF4, false),
    ] {
        let matrix = Matrix::quantize(rows, cols, data.clone(), quant, fp16).unwrap();
        c.bench_function(name, |bencher| {
            bencher.iter(|| {
                matrix.matvec(black_box(&x), black_box(&mut output)).unwrap();
            });
        });
    }
}

criterion_group!(benches, bench_matvec);
criterion_main!(benches);
