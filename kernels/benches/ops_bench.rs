use criterion::{Criterion, criterion_group, criterion_main};
use ringtrain_kernels::{
    BlockShape, attention_block_backward, attention_block_forward, cpu_matmul_nt,
};
use std::hint::black_box;

fn signal(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.1 + phase).sin()).collect()
}

fn benchmark_matmul_nt(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul_nt");
    for &size in &[64usize, 128, 256] {
        let shape = [size, size];
        let lhs = signal(size * size, 0.0);
        let rhs = signal(size * size, 1.0);
        group.bench_function(format!("{size}x{size}"), |b| {
            b.iter(|| {
                cpu_matmul_nt(black_box(&lhs), black_box(&rhs), &shape, &shape).unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_attention_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("attention_block");
    for &len in &[32usize, 128] {
        let shape = BlockShape {
            heads: 4,
            q_len: len,
            kv_len: len,
            head_dim: 32,
        };
        let n = shape.heads * len * shape.head_dim;
        let q = signal(n, 0.0);
        let k = signal(n, 0.5);
        let v = signal(n, 1.5);
        let d_out = signal(n, 2.5);

        group.bench_function(format!("forward_causal_{len}"), |b| {
            b.iter(|| {
                attention_block_forward(black_box(&q), &k, &v, shape, 0.17, true).unwrap()
            })
        });

        let fwd = attention_block_forward(&q, &k, &v, shape, 0.17, true).unwrap();
        let lse: Vec<f64> = fwd.lse.iter().map(|&x| f64::from(x)).collect();
        group.bench_function(format!("backward_causal_{len}"), |b| {
            b.iter(|| {
                attention_block_backward(
                    black_box(&q),
                    &k,
                    &v,
                    &fwd.out,
                    &d_out,
                    &lse,
                    shape,
                    0.17,
                    true,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_matmul_nt, benchmark_attention_block);
criterion_main!(benches);
