//! Numeric building blocks shared by the attention modules and the ring engine.

pub mod block;
pub mod online_softmax;

pub use block::{BlockGrads, block_backward, block_forward};
pub use online_softmax::{Partial, merge};
