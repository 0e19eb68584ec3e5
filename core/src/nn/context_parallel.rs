//! Swapping a model's attention layers for ring attention.
//!
//! A model exposes its attention layers through [`AttentionHost`]. [`substitute_ring_attention`]
//! rebuilds every plain layer as a [`RingAttention`] from the layer's [`AttentionSource`] view:
//! projection weights are copied, the rotary tables are shared, nothing is re-initialized. With a
//! ring of one worker the substituted model computes exactly what the original did.
//!
//! [`ContextParallel`] bundles the substitution with the rank's place in the sequence.

use super::attention::{AttentionModule, AttentionSource, HeadLayout, attention_pipeline};
use super::linear::Linear;
use super::module::{Parameter, Parameters};
use super::rope::Rotary;
use crate::autograd::{Variable, apply};
use crate::distributed::ring_attention::{RingAttentionConfig, RingAttentionFn, RingChannels};
use crate::distributed::transport::RingTransport;
use crate::error::Result;
use crate::tensor::TensorElem;
use num_traits::Float;
use std::cell::RefCell;
use std::fmt::Debug;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use tracing::info;

/// Attention layer whose core runs as ring attention over this worker's sequence slice.
pub struct RingAttention<T: TensorElem> {
    q_proj: Linear<T>,
    k_proj: Linear<T>,
    v_proj: Linear<T>,
    o_proj: Linear<T>,
    layout: HeadLayout,
    causal: bool,
    rotary: Option<Rc<Rotary<T>>>,
    channels: Rc<RefCell<RingChannels>>,
}

impl<T: TensorElem> Debug for RingAttention<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.try_borrow();
        f.debug_struct("RingAttention")
            .field("layout", &self.layout)
            .field("causal", &self.causal)
            .field("rotary", &self.rotary.is_some())
            .field("rank", &channels.as_ref().map(|c| c.rank()).ok())
            .field("world_size", &channels.as_ref().map(|c| c.world_size()).ok())
            .finish()
    }
}

impl<T: TensorElem + Float + 'static> RingAttention<T> {
    /// Builds the ring version of `source`.
    pub fn from_source(source: &dyn AttentionSource<T>, channels: RingChannels) -> Result<Self> {
        let layout = HeadLayout {
            num_heads: source.num_heads(),
            num_kv_heads: source.num_kv_heads(),
            head_dim: source.head_dim(),
        };
        let (q, k, v, o) = (
            source.q_proj().detached_copy(),
            source.k_proj().detached_copy(),
            source.v_proj().detached_copy(),
            source.o_proj().detached_copy(),
        );
        layout.validate(&q, &k, &v, &o)?;
        layout.check_rotary(source.rotary())?;

        Ok(Self {
            q_proj: q,
            k_proj: k,
            v_proj: v,
            o_proj: o,
            layout,
            causal: source.is_causal(),
            rotary: source.rotary().cloned(),
            channels: Rc::new(RefCell::new(channels)),
        })
    }

    pub fn config(&self) -> RingAttentionConfig {
        RingAttentionConfig::for_head_dim(self.layout.head_dim, self.causal)
    }
}

impl<T: TensorElem + 'static> Parameters<T> for RingAttention<T> {
    fn parameters(&self) -> Vec<&dyn Parameter<T>> {
        vec![
            &self.q_proj.weight,
            &self.k_proj.weight,
            &self.v_proj.weight,
            &self.o_proj.weight,
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<T>> {
        vec![
            &mut self.q_proj.weight,
            &mut self.k_proj.weight,
            &mut self.v_proj.weight,
            &mut self.o_proj.weight,
        ]
    }
}

impl<T: TensorElem + 'static> AttentionSource<T> for RingAttention<T> {
    fn hidden_size(&self) -> usize {
        self.q_proj.in_features()
    }
    fn num_heads(&self) -> usize {
        self.layout.num_heads
    }
    fn num_kv_heads(&self) -> usize {
        self.layout.num_kv_heads
    }
    fn head_dim(&self) -> usize {
        self.layout.head_dim
    }
    fn is_causal(&self) -> bool {
        self.causal
    }
    fn q_proj(&self) -> &Linear<T> {
        &self.q_proj
    }
    fn k_proj(&self) -> &Linear<T> {
        &self.k_proj
    }
    fn v_proj(&self) -> &Linear<T> {
        &self.v_proj
    }
    fn o_proj(&self) -> &Linear<T> {
        &self.o_proj
    }
    fn rotary(&self) -> Option<&Rc<Rotary<T>>> {
        self.rotary.as_ref()
    }
}

impl<T: TensorElem + Float + 'static> AttentionModule<T> for RingAttention<T> {
    /// `x` is this worker's slice `[batch, local_len, hidden]`; `positions` must be the slice's
    /// absolute positions (see [`ContextParallel::local_positions`]).
    fn forward(&self, x: &Variable<T, 3>, positions: &[usize]) -> Result<Variable<T, 3>> {
        let config = self.config();
        attention_pipeline(self, x, positions, |q, k, v| {
            apply(RingAttentionFn::new(self.channels.clone(), config), &[q, k, v])
        })
    }

    fn source(&self) -> &dyn AttentionSource<T> {
        self
    }

    fn is_ring(&self) -> bool {
        true
    }
}

/// A model with replaceable attention layers.
pub trait AttentionHost<T: TensorElem> {
    /// Every attention slot, in layer order.
    fn attention_slots(&mut self) -> Vec<&mut Box<dyn AttentionModule<T>>>;
}

/// Replaces every non-ring attention layer of `model`; returns how many were replaced.
///
/// `comm_factory` is called with the layer index and supplies that layer's channels. Layers that
/// already run ring attention are left untouched, so calling this twice is harmless.
pub fn substitute_ring_attention<T, H, F>(model: &mut H, mut comm_factory: F) -> Result<usize>
where
    T: TensorElem + Float + 'static,
    H: AttentionHost<T> + ?Sized,
    F: FnMut(usize) -> Result<RingChannels>,
{
    let mut replaced = 0;
    for (layer, slot) in model.attention_slots().into_iter().enumerate() {
        if slot.is_ring() {
            continue;
        }
        let ring = RingAttention::from_source(slot.source(), comm_factory(layer)?)?;
        *slot = Box::new(ring);
        replaced += 1;
    }
    info!(replaced, "ring attention substituted");
    Ok(replaced)
}

/// A model whose attention runs as ring attention on one rank of a context-parallel ring.
///
/// Dereferences to the wrapped model for everything else.
#[derive(Debug)]
pub struct ContextParallel<M> {
    model: M,
    rank: usize,
    world_size: usize,
}

impl<M> ContextParallel<M> {
    /// Substitutes every attention layer of `model`, all layers sharing `transport`.
    pub fn new<T>(mut model: M, transport: Arc<dyn RingTransport>) -> Result<Self>
    where
        T: TensorElem + Float + 'static,
        M: AttentionHost<T>,
    {
        let topology = transport.topology()?;
        substitute_ring_attention(&mut model, |_| RingChannels::new(transport.clone()))?;
        Ok(Self {
            model,
            rank: topology.rank(),
            world_size: topology.world_size(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Absolute positions of this rank's slice when every rank holds `local_len` tokens.
    pub fn local_positions(&self, local_len: usize) -> Vec<usize> {
        let start = self.rank * local_len;
        (start..start + local_len).collect()
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

/// The wrapped model's parameters, so a [`DataParallel`](crate::distributed::DataParallel)
/// replica can hold a context-parallel model.
impl<T: TensorElem, M: Parameters<T>> Parameters<T> for ContextParallel<M> {
    fn parameters(&self) -> Vec<&dyn Parameter<T>> {
        self.model.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut dyn Parameter<T>> {
        self.model.parameters_mut()
    }
}

impl<M> Deref for ContextParallel<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}
