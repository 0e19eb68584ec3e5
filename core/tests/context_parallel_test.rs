use ringtrain::autograd::Variable;
use ringtrain::distributed::{
    CpuBackend, DataParallel, GridEndpoints, LocalRing, ParallelConfig, RingTransport,
};
use ringtrain::nn::{
    AttentionHost, AttentionModule, ContextParallel, HeadLayout, Linear, MultiHeadAttention,
    Parameter, Parameters, Rotary,
};
use ringtrain::tensor::Tensor;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

const HIDDEN: usize = 8;
const SEQ: usize = 6;

#[derive(Debug)]
struct Decoder {
    layers: Vec<Box<dyn AttentionModule<f64>>>,
}

impl AttentionHost<f64> for Decoder {
    fn attention_slots(&mut self) -> Vec<&mut Box<dyn AttentionModule<f64>>> {
        self.layers.iter_mut().collect()
    }
}

impl Parameters<f64> for Decoder {
    fn parameters(&self) -> Vec<&dyn Parameter<f64>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<f64>> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }
}

impl Decoder {
    fn new(causal: bool) -> Self {
        let rotary = Rc::new(Rotary::new(4, 64, 10_000.0).unwrap());
        let layout = HeadLayout {
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 4,
        };
        let proj = |out: usize, seed: f64| {
            Linear::new(Tensor::from_fn([out, HIDDEN], |i| {
                ((i as f64 + seed) * 0.61).sin() * 0.4
            }))
        };
        let layers = (0..2)
            .map(|l| {
                let s = 10.0 * l as f64;
                let mha = MultiHeadAttention::new(
                    layout,
                    [proj(8, s), proj(4, s + 1.0), proj(4, s + 2.0), proj(8, s + 3.0)],
                    causal,
                    Some(rotary.clone()),
                )
                .unwrap();
                Box::new(mha) as Box<dyn AttentionModule<f64>>
            })
            .collect();
        Self { layers }
    }

    fn forward(&self, x: &Variable<f64, 3>, positions: &[usize]) -> Variable<f64, 3> {
        let mut h = self.layers[0].forward(x, positions).unwrap();
        for layer in &self.layers[1..] {
            h = layer.forward(&h, positions).unwrap();
        }
        h
    }

    /// Flattened weight gradients, layer by layer.
    fn weight_grads(&self) -> Vec<f64> {
        self.layers
            .iter()
            .flat_map(|l| l.parameters().into_iter().map(|p| p.flat_grad().unwrap().unwrap()))
            .flat_map(|g| g.into_data())
            .collect()
    }
}

fn hidden_states() -> Tensor<f64, 3> {
    batch(0)
}

/// Input of data-parallel replica `replica`.
fn batch(replica: usize) -> Tensor<f64, 3> {
    Tensor::from_fn([1, SEQ, HIDDEN], |i| ((i + 11 * replica) as f64 * 0.23).cos())
}

fn upstream() -> Tensor<f64, 3> {
    Tensor::from_fn([1, SEQ, HIDDEN], |i| (i as f64 * 0.71).sin())
}

struct Reference {
    out: Tensor<f64, 3>,
    dx: Tensor<f64, 3>,
    dw: Vec<f64>,
}

fn reference(causal: bool) -> Reference {
    reference_on(hidden_states(), causal)
}

fn reference_on(input: Tensor<f64, 3>, causal: bool) -> Reference {
    let model = Decoder::new(causal);
    let x = Variable::new(input);
    let positions: Vec<usize> = (0..SEQ).collect();
    let y = model.forward(&x, &positions);
    y.backward_with(upstream()).unwrap();
    Reference {
        out: y.data.clone(),
        dx: x.grad().unwrap(),
        dw: model.weight_grads(),
    }
}

type RankResult = (Tensor<f64, 3>, Tensor<f64, 3>, Vec<f64>);

fn run_context_parallel(world: usize, causal: bool) -> Vec<RankResult> {
    let local_len = SEQ / world;
    let endpoints = LocalRing::new(world).unwrap();
    thread::scope(|s| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                s.spawn(move || {
                    let transport: Arc<dyn RingTransport> = Arc::new(ep);
                    let cp = ContextParallel::new::<f64>(Decoder::new(causal), transport).unwrap();
                    assert!(cp.layers.iter().all(|l| l.is_ring()));

                    let start = cp.rank() * local_len;
                    let x = Variable::new(hidden_states().narrow(1, start, local_len).unwrap());
                    let y = cp.forward(&x, &cp.local_positions(local_len));
                    y.backward_with(upstream().narrow(1, start, local_len).unwrap())
                        .unwrap();
                    (y.data.clone(), x.grad().unwrap(), cp.weight_grads())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "element {i}: {x} vs {y}");
    }
}

#[test]
fn test_context_parallel_matches_single_worker_model() {
    for causal in [true, false] {
        let expected = reference(causal);
        for world in [1, 2, 3] {
            let local_len = SEQ / world;
            let results = run_context_parallel(world, causal);

            let mut dw_sum = vec![0.0; expected.dw.len()];
            for (rank, (out, dx, dw)) in results.iter().enumerate() {
                let rows = |t: &Tensor<f64, 3>| t.narrow(1, rank * local_len, local_len).unwrap();
                assert_close(out.data(), rows(&expected.out).data(), 1e-10);
                assert_close(dx.data(), rows(&expected.dx).data(), 1e-9);
                for (acc, g) in dw_sum.iter_mut().zip(dw) {
                    *acc += g;
                }
            }
            // Each rank holds the weight gradient of its own slice; together they make the whole.
            assert_close(&dw_sum, &expected.dw, 1e-9);
        }
    }
}

#[test]
fn test_into_inner_keeps_substituted_layers() {
    let ep: Arc<dyn RingTransport> = Arc::new(LocalRing::new(1).unwrap().remove(0));
    let cp = ContextParallel::new::<f64>(Decoder::new(true), ep).unwrap();
    assert_eq!((cp.rank(), cp.world_size()), (0, 1));
    let model = cp.into_inner();
    assert_eq!(model.layers.len(), 2);
    assert!(model.layers.iter().all(|l| l.is_ring()));
}

/// `(cp_rank, dp_rank, output slice, weight gradients)` of one grid worker.
type GridResult = (usize, usize, Tensor<f64, 3>, Vec<f64>);

/// Runs a `cp_size × dp_size` job: each replica splits its own batch over a context-parallel ring
/// and the replicas average weight gradients.
fn run_grid(config: ParallelConfig, causal: bool) -> Vec<GridResult> {
    let local_len = SEQ / config.cp_size;
    let workers = LocalRing::grid(config).unwrap();
    thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|GridEndpoints { grid, cp, dp }| {
                s.spawn(move || {
                    let model = ContextParallel::new::<f64>(Decoder::new(causal), Arc::new(cp))
                        .unwrap();
                    let backend = Arc::new(CpuBackend::new(Arc::new(dp)).unwrap());
                    let replica = DataParallel::new::<f64>(model, backend);

                    let start = grid.cp_rank() * local_len;
                    let x = batch(grid.dp_rank()).narrow(1, start, local_len).unwrap();
                    let y = replica
                        .forward(&Variable::new(x), |m, x| {
                            Ok(m.forward(x, &m.local_positions(local_len)))
                        })
                        .unwrap();
                    y.backward_with(upstream().narrow(1, start, local_len).unwrap())
                        .unwrap();
                    let dw = replica.module().weight_grads();
                    (grid.cp_rank(), grid.dp_rank(), y.data.clone(), dw)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_context_and_data_parallel_share_a_grid() {
    let config = ParallelConfig::from_json(r#"{"cp_size": 2, "dp_size": 2}"#).unwrap();
    let local_len = SEQ / config.cp_size;
    for causal in [true, false] {
        let references: Vec<Reference> = (0..config.dp_size)
            .map(|d| reference_on(batch(d), causal))
            .collect();
        let n = references[0].dw.len();
        let mean_dw: Vec<f64> = (0..n)
            .map(|i| references.iter().map(|r| r.dw[i]).sum::<f64>() / config.dp_size as f64)
            .collect();

        let results = run_grid(config, causal);
        assert_eq!(results.len(), config.world_size());

        let mut dw_by_replica = vec![vec![0.0; n]; config.dp_size];
        for (cp_rank, dp_rank, out, dw) in &results {
            let rows = references[*dp_rank]
                .out
                .narrow(1, cp_rank * local_len, local_len)
                .unwrap();
            assert_close(out.data(), rows.data(), 1e-10);
            for (acc, g) in dw_by_replica[*dp_rank].iter_mut().zip(dw) {
                *acc += g;
            }
        }
        // Slices add up to the whole sequence; replicas agree on the batch average.
        for dw in &dw_by_replica {
            assert_close(dw, &mean_dw, 1e-9);
        }
    }
}
