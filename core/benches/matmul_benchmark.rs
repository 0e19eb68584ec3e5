use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ringtrain::autograd::Variable;
use ringtrain::tensor::Tensor;

fn benchmark_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");

    for &size in &[32usize, 128] {
        let a = Tensor::<f32, 2>::from_fn([size, size], |i| (i as f32 * 0.01).sin());
        let b = Tensor::<f32, 2>::from_fn([size, size], |i| (i as f32 * 0.02).cos());

        group.bench_function(format!("cpu_{size}x{size}"), |bench| {
            bench.iter(|| black_box(a.matmul(&b).unwrap()))
        });
        // Projection layout: rhs stored as [out, in].
        group.bench_function(format!("cpu_nt_{size}x{size}"), |bench| {
            bench.iter(|| black_box(a.matmul_nt(&b).unwrap()))
        });
    }

    // Forward plus backward through the tape.
    let x = Tensor::<f32, 2>::from_fn([64, 64], |i| (i as f32 * 0.01).sin());
    let w = Tensor::<f32, 2>::from_fn([64, 64], |i| (i as f32 * 0.03).cos());
    group.bench_function("autograd_nt_64x64", |bench| {
        bench.iter(|| {
            let x = Variable::new(x.clone());
            let w = Variable::new(w.clone());
            let y = x.matmul_nt(&w).unwrap();
            y.backward().unwrap();
            black_box(w.grad())
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_matmul);
criterion_main!(benches);
