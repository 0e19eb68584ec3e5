//! Layers: bias-free projections, rotary embeddings, and the attention layers that can be swapped
//! for their ring-distributed counterparts.

pub mod attention;
pub mod context_parallel;
pub mod linear;
pub mod module;
pub mod rope;

pub use attention::{
    AttentionModule, AttentionSource, HeadLayout, MultiHeadAttention, local_attention, repeat_kv,
};
pub use context_parallel::{
    AttentionHost, ContextParallel, RingAttention, substitute_ring_attention,
};
pub use linear::Linear;
pub use module::{Parameter, Parameters};
pub use rope::{Rotary, apply_rotary};
