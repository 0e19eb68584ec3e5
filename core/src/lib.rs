//! # ringtrain
//!
//! Sequence- and data-parallel training primitives on CPU tensors.
//!
//! A long sequence is split into `W` contiguous slices, one per worker. Ring attention lets every
//! worker attend its queries to the whole (causally visible) sequence while only ever holding one
//! remote key/value block at a time. Data parallelism averages gradients across model replicas.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional CPU tensors.
//! - [`autograd`]: A small reverse-mode tape with custom [`autograd::Function`]s and gradient hooks.
//! - [`kernels`]: Block attention and the online-softmax merge.
//! - [`distributed`]: Ring transport, ring attention, collectives and [`distributed::DataParallel`].
//! - [`nn`]: Projections, rotary embeddings, attention layers and ring substitution.
//!
//! ## Example
//!
//! ```rust
//! use ringtrain::kernels::{block_forward, merge};
//! use ringtrain::tensor::Tensor;
//!
//! // [batch, heads, seq, head_dim]
//! let q = Tensor::<f64, 4>::from_fn([1, 1, 4, 2], |i| (i as f64).sin());
//! let k = Tensor::<f64, 4>::from_fn([1, 1, 4, 2], |i| (i as f64).cos());
//! let v = Tensor::<f64, 4>::from_fn([1, 1, 4, 2], |i| i as f64);
//!
//! // Attending to the two halves of K/V separately and merging gives full attention.
//! let (k0, k1) = (k.narrow(2, 0, 2).unwrap(), k.narrow(2, 2, 2).unwrap());
//! let (v0, v1) = (v.narrow(2, 0, 2).unwrap(), v.narrow(2, 2, 2).unwrap());
//! let scale = 1.0 / 2f64.sqrt();
//! let a = block_forward(&q, &k0, &v0, scale, false).unwrap();
//! let b = block_forward(&q, &k1, &v1, scale, false).unwrap();
//! let merged = merge(Some(a), b).unwrap();
//!
//! let full = block_forward(&q, &k, &v, scale, false).unwrap();
//! for (x, y) in merged.out.data().iter().zip(full.out.data()) {
//!     assert!((x - y).abs() < 1e-12);
//! }
//! ```

pub mod autograd;
pub mod distributed;
pub mod error;
pub mod kernels;
pub mod nn;
pub mod tensor;

pub use autograd::Variable;
pub use error::{Error, Result};
pub use tensor::{Cpu, Device, Storage, Tensor, TensorElem, TensorError, TensorOps};
