//! Ring attention: exact attention over a sequence sharded across a ring of workers.
//!
//! Rank `r` of `W` holds the `r`-th contiguous slice of the sequence for Q, K and V. Over `W` steps
//! the K/V blocks rotate one position around the ring; at every step each rank attends its local
//! queries to whatever block it currently holds and folds the result into a running online-softmax
//! state. The exchange for step `s + 1` is launched before the compute of step `s` and only waited
//! on afterwards, so transfer and compute overlap.
//!
//! With a causal mask, the block held at step `s` comes from rank `(r - s) mod W`; it precedes the
//! local queries iff `s <= r`, and only the local block (`s == 0`) needs the triangular mask.
//!
//! The backward pass replays the rotation. A second channel carries a dK/dV accumulator alongside
//! each K/V block: every rank adds its contribution for the block it holds and passes the sum on,
//! so after `W` hops each accumulator is back home holding the complete gradient.

use super::ring::{RingComm, Ticket};
use super::transport::RingTransport;
use crate::autograd::Function;
use crate::error::{Error, Result};
use crate::kernels::{Partial, block_backward, block_forward, merge};
use crate::tensor::{Cpu, Tensor, TensorElem};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

pub const FORWARD_CHANNEL: &str = "ring_attn.fwd";
pub const BACKWARD_KV_CHANNEL: &str = "ring_attn.bwd_kv";
pub const BACKWARD_DKV_CHANNEL: &str = "ring_attn.bwd_dkv";

/// Per-call attention settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RingAttentionConfig {
    pub causal: bool,
    /// Multiplier applied to `q·k` before the softmax.
    pub scale: f64,
}

impl RingAttentionConfig {
    /// Standard scaling `1 / sqrt(head_dim)`.
    pub fn for_head_dim(head_dim: usize, causal: bool) -> Self {
        Self {
            causal,
            scale: 1.0 / (head_dim as f64).sqrt(),
        }
    }
}

/// The three channels one ring attention layer talks on.
#[derive(Debug)]
pub struct RingChannels {
    fwd: RingComm,
    bwd_kv: RingComm,
    bwd_dkv: RingComm,
}

impl RingChannels {
    pub fn new(transport: Arc<dyn RingTransport>) -> Result<Self> {
        Ok(Self {
            fwd: RingComm::new(transport.clone(), FORWARD_CHANNEL)?,
            bwd_kv: RingComm::new(transport.clone(), BACKWARD_KV_CHANNEL)?,
            bwd_dkv: RingComm::new(transport, BACKWARD_DKV_CHANNEL)?,
        })
    }

    pub fn rank(&self) -> usize {
        self.fwd.topology().rank()
    }

    pub fn world_size(&self) -> usize {
        self.fwd.topology().world_size()
    }
}

/// Everything the backward pass needs from the forward.
#[derive(Debug, Clone)]
pub struct RingSaved<T: TensorElem> {
    pub q: Tensor<T, 4, Cpu>,
    /// The rank's own key block (before any rotation).
    pub k: Tensor<T, 4, Cpu>,
    pub v: Tensor<T, 4, Cpu>,
    pub out: Tensor<T, 4, Cpu>,
    pub lse: Tensor<f64, 3, Cpu>,
}

/// Output of [`ring_attention_forward`].
#[derive(Debug, Clone)]
pub struct RingOutput<T: TensorElem> {
    pub out: Tensor<T, 4, Cpu>,
    pub lse: Tensor<f64, 3, Cpu>,
}

/// Local gradients produced by [`ring_attention_backward`].
#[derive(Debug, Clone)]
pub struct RingGrads<T: TensorElem> {
    pub dq: Tensor<T, 4, Cpu>,
    pub dk: Tensor<T, 4, Cpu>,
    pub dv: Tensor<T, 4, Cpu>,
}

type KvTickets<T> = (Ticket<T, 4>, Ticket<T, 4>);

/// Launches the rotation of a K/V (or dK/dV) pair as one batch.
fn launch<T: TensorElem>(
    comm: &mut RingComm,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
) -> Result<KvTickets<T>> {
    let tk = comm.exchange(k)?;
    let tv = comm.exchange(v)?;
    comm.commit()?;
    Ok((tk, tv))
}

fn land<T: TensorElem>(
    comm: &mut RingComm,
    (tk, tv): KvTickets<T>,
) -> Result<(Tensor<T, 4, Cpu>, Tensor<T, 4, Cpu>)> {
    let mut done = comm.wait()?;
    Ok((done.take(tk)?, done.take(tv)?))
}

fn check_qkv<T: TensorElem>(
    q: &Tensor<T, 4, Cpu>,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
) -> Result<()> {
    for t in [k, v] {
        if t.shape() != q.shape() {
            return Err(crate::tensor::TensorError::ShapeMismatch {
                expected: q.shape().to_vec(),
                got: t.shape().to_vec(),
            }
            .into());
        }
    }
    Ok(())
}

/// State threaded through the forward steps.
struct ForwardState<T: TensorElem> {
    k: Tensor<T, 4, Cpu>,
    v: Tensor<T, 4, Cpu>,
    partial: Option<Partial>,
}

/// Ring attention of the local query block against the whole distributed sequence.
///
/// `q`, `k` and `v` are this rank's `[batch, heads, local_len, head_dim]` blocks; every rank must
/// call this with the same shapes. Returns the output in the compute precision and the `f64`
/// log-sum-exp of every local query row.
pub fn ring_attention_forward<T>(
    comm: &mut RingComm,
    q: &Tensor<T, 4, Cpu>,
    k: &Tensor<T, 4, Cpu>,
    v: &Tensor<T, 4, Cpu>,
    config: RingAttentionConfig,
) -> Result<RingOutput<T>>
where
    T: TensorElem + Float,
{
    check_qkv(q, k, v)?;
    let topo = comm.topology();
    let world = topo.world_size();

    let mut state = ForwardState {
        k: k.clone(),
        v: v.clone(),
        partial: None,
    };

    for step in 0..world {
        let in_flight = if step + 1 < world {
            Some(launch(comm, &state.k, &state.v)?)
        } else {
            None
        };

        let visible = topo.is_visible(step, config.causal);
        debug!(
            rank = topo.rank(),
            step,
            origin = topo.block_origin(step),
            visible,
            "ring attention forward"
        );
        if visible {
            let block = block_forward(
                q,
                &state.k,
                &state.v,
                config.scale,
                config.causal && step == 0,
            )?;
            state.partial = Some(merge(state.partial.take(), block)?);
        }

        if let Some(tickets) = in_flight {
            (state.k, state.v) = land(comm, tickets)?;
        }
    }

    // Step 0 is always visible, so the state is populated.
    let Partial { out, lse } = state
        .partial
        .ok_or_else(|| Error::Topology("ring attention ran zero steps".into()))?;
    Ok(RingOutput {
        out: out.cast()?,
        lse,
    })
}

/// State threaded through the backward steps.
struct BackwardState<T: TensorElem> {
    k: Tensor<T, 4, Cpu>,
    v: Tensor<T, 4, Cpu>,
    dq: Tensor<f64, 4, Cpu>,
    /// dK/dV accumulator sent on the previous step, not yet received by this rank.
    dkv_in_flight: Option<KvTickets<f64>>,
}

/// Gradients of [`ring_attention_forward`] with respect to the local Q, K and V blocks.
///
/// Uses two channels: `kv_comm` replays the K/V rotation, `dkv_comm` carries the gradient
/// accumulators. The accumulator for a block is waited on only after this rank's contribution to
/// it has been computed.
pub fn ring_attention_backward<T>(
    kv_comm: &mut RingComm,
    dkv_comm: &mut RingComm,
    saved: &RingSaved<T>,
    d_out: &Tensor<T, 4, Cpu>,
    config: RingAttentionConfig,
) -> Result<RingGrads<T>>
where
    T: TensorElem + Float,
{
    check_qkv(&saved.q, &saved.k, &saved.v)?;
    check_qkv(&saved.q, &saved.out, d_out)?;
    let topo = kv_comm.topology();
    if dkv_comm.topology() != topo {
        return Err(Error::Topology(
            "K/V and dK/dV channels disagree on the ring".into(),
        ));
    }
    let world = topo.world_size();
    let shape = *saved.k.shape();

    let mut state = BackwardState {
        k: saved.k.clone(),
        v: saved.v.clone(),
        dq: Tensor::zeros(*saved.q.shape()),
        dkv_in_flight: None,
    };

    for step in 0..world {
        let kv_in_flight = if step + 1 < world {
            Some(launch(kv_comm, &state.k, &state.v)?)
        } else {
            None
        };

        let visible = topo.is_visible(step, config.causal);
        debug!(
            rank = topo.rank(),
            step,
            origin = topo.block_origin(step),
            visible,
            "ring attention backward"
        );
        let grads = if visible {
            let g = block_backward(
                &saved.q,
                &state.k,
                &state.v,
                &saved.out,
                d_out,
                &saved.lse,
                config.scale,
                config.causal && step == 0,
            )?;
            state.dq = (&state.dq + &g.dq)?;
            Some(g)
        } else {
            None
        };

        let (mut dk, mut dv) = match state.dkv_in_flight.take() {
            Some(tickets) => land(dkv_comm, tickets)?,
            None => (Tensor::zeros(shape), Tensor::zeros(shape)),
        };
        if let Some(g) = grads {
            dk = (&dk + &g.dk)?;
            dv = (&dv + &g.dv)?;
        }

        if let Some(tickets) = kv_in_flight {
            (state.k, state.v) = land(kv_comm, tickets)?;
        }

        state.dkv_in_flight = Some(launch(dkv_comm, &dk, &dv)?);
    }

    // After W hops the accumulator of this rank's own block has come home.
    let (dk, dv) = match state.dkv_in_flight.take() {
        Some(tickets) => land(dkv_comm, tickets)?,
        None => return Err(Error::Topology("ring attention ran zero steps".into())),
    };

    Ok(RingGrads {
        dq: state.dq.cast()?,
        dk: dk.cast()?,
        dv: dv.cast()?,
    })
}

/// Ring attention as a differentiable operation on `[q, k, v]`.
///
/// Channels are shared with the owning module; the forward uses the forward channel, the backward
/// the two backward channels.
pub struct RingAttentionFn {
    channels: Rc<RefCell<RingChannels>>,
    config: RingAttentionConfig,
}

impl RingAttentionFn {
    pub fn new(channels: Rc<RefCell<RingChannels>>, config: RingAttentionConfig) -> Self {
        Self { channels, config }
    }

    fn channels(&self) -> Result<std::cell::RefMut<'_, RingChannels>> {
        self.channels
            .try_borrow_mut()
            .map_err(|_| Error::Autograd("ring channels are already in use".into()))
    }
}

impl<T: TensorElem + Float> Function<T, 4, 4> for RingAttentionFn {
    type Saved = RingSaved<T>;

    fn name(&self) -> &'static str {
        "ring_attention"
    }

    fn forward(&self, inputs: &[&Tensor<T, 4, Cpu>]) -> Result<(Tensor<T, 4, Cpu>, RingSaved<T>)> {
        let [q, k, v] = inputs else {
            return Err(Error::Autograd(format!(
                "ring attention takes [q, k, v], got {} inputs",
                inputs.len()
            )));
        };
        let mut channels = self.channels()?;
        let RingOutput { out, lse } =
            ring_attention_forward(&mut channels.fwd, q, k, v, self.config)?;
        let saved = RingSaved {
            q: (*q).clone(),
            k: (*k).clone(),
            v: (*v).clone(),
            out: out.clone(),
            lse,
        };
        Ok((out, saved))
    }

    fn backward(
        &self,
        saved: RingSaved<T>,
        grad_output: &Tensor<T, 4, Cpu>,
    ) -> Result<Vec<Option<Tensor<T, 4, Cpu>>>> {
        let mut channels = self.channels()?;
        let RingChannels {
            bwd_kv, bwd_dkv, ..
        } = &mut *channels;
        let RingGrads { dq, dk, dv } =
            ring_attention_backward(bwd_kv, bwd_dkv, &saved, grad_output, self.config)?;
        Ok(vec![Some(dq), Some(dk), Some(dv)])
    }
}
