use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ringtrain::distributed::{
    LocalRing, RingAttentionConfig, RingComm, RingSaved, RingTransport, ring_attention_backward,
    ring_attention_forward,
};
use ringtrain::kernels::{Partial, block_forward, merge};
use ringtrain::tensor::Tensor;
use std::sync::Arc;
use std::thread;

const HEADS: usize = 4;
const HEAD_DIM: usize = 32;
const SEQ: usize = 256;

fn sequence(phase: f32) -> Tensor<f32, 4> {
    Tensor::from_fn([1, HEADS, SEQ, HEAD_DIM], |i| (i as f32 * 0.013 + phase).sin())
}

/// One causal forward (and optionally backward) over `world` ranks, one thread per rank.
fn ring_step(
    world: usize,
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    backward: bool,
) {
    let local = SEQ / world;
    let config = RingAttentionConfig::for_head_dim(HEAD_DIM, true);
    let endpoints = LocalRing::new(world).unwrap();
    thread::scope(|s| {
        for (rank, ep) in endpoints.into_iter().enumerate() {
            s.spawn(move || {
                let transport: Arc<dyn RingTransport> = Arc::new(ep);
                let mut fwd = RingComm::new(transport.clone(), "bench.fwd").unwrap();
                let shard = |t: &Tensor<f32, 4>| t.narrow(2, rank * local, local).unwrap();
                let (q, k, v) = (shard(q), shard(k), shard(v));
                let out = ring_attention_forward(&mut fwd, &q, &k, &v, config).unwrap();
                if backward {
                    let mut kv = RingComm::new(transport.clone(), "bench.kv").unwrap();
                    let mut dkv = RingComm::new(transport, "bench.dkv").unwrap();
                    let d_out = Tensor::ones(*q.shape());
                    let saved = RingSaved {
                        q,
                        k,
                        v,
                        out: out.out,
                        lse: out.lse,
                    };
                    black_box(
                        ring_attention_backward(&mut kv, &mut dkv, &saved, &d_out, config)
                            .unwrap(),
                    );
                } else {
                    black_box(out);
                }
            });
        }
    });
}

fn benchmark_ring_attention(c: &mut Criterion) {
    let (q, k, v) = (sequence(0.0), sequence(0.7), sequence(1.9));
    let mut group = c.benchmark_group("ring_attention");
    group.sample_size(20);

    let scale = 1.0 / (HEAD_DIM as f64).sqrt();
    group.bench_function("full_sequence_single_block", |b| {
        b.iter(|| black_box(block_forward(&q, &k, &v, scale, true).unwrap()))
    });

    for &world in &[1usize, 2, 4] {
        group.bench_function(format!("forward_w{world}"), |b| {
            b.iter(|| ring_step(world, &q, &k, &v, false))
        });
        group.bench_function(format!("forward_backward_w{world}"), |b| {
            b.iter(|| ring_step(world, &q, &k, &v, true))
        });
    }

    group.finish();
}

fn benchmark_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("online_softmax_merge");
    for &len in &[64usize, 512] {
        let partial = |phase: f64| {
            let out = Tensor::from_fn([1, HEADS, len, HEAD_DIM], |i| {
                (i as f64 * 0.01 + phase).sin()
            });
            let lse = Tensor::from_fn([1, HEADS, len], |i| (i as f64 * 0.03 + phase).cos());
            Partial::new(out, lse).unwrap()
        };
        let (acc, block) = (partial(0.0), partial(1.0));
        group.bench_function(format!("len_{len}"), |b| {
            b.iter(|| black_box(merge(Some(acc.clone()), block.clone()).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_ring_attention, benchmark_merge);
criterion_main!(benches);
