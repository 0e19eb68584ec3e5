//! # Distributed Training
//!
//! Two ways of splitting a training step across workers live here.
//!
//! ## Context Parallelism (CP)
//! *   **Concept**: Split the *sequence*. Each of `W` workers holds one contiguous slice of every
//!     sequence in the batch.
//! *   **Problem**: Attention needs every query to see every (earlier) key.
//! *   **Solution**: [`ring_attention`]. Key/value blocks travel around a ring while each worker
//!     folds them into an online softmax, so no worker ever holds the whole sequence.
//!
//! ## Data Parallelism (DP)
//! *   **Concept**: Replicate the model, split the *batch*.
//! *   **Communication**: Gradients are averaged with **All-Reduce** ([`DataParallel`]).
//!
//! Both sit on the same plumbing: a [`RingTransport`] (send to next, receive from previous) and
//! [`RingComm`] channels that batch exchanges and separate launch from completion. [`LocalRing`]
//! runs a whole ring inside one process, one thread per rank.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use ringtrain::distributed::{CollectiveBackend, CpuBackend, LocalRing};
//! use ringtrain::tensor::Tensor;
//!
//! let handles: Vec<_> = LocalRing::new(2)
//!     .unwrap()
//!     .into_iter()
//!     .map(|ep| {
//!         thread::spawn(move || {
//!             let backend = CpuBackend::new(Arc::new(ep)).unwrap();
//!             let t = Tensor::<f32, 1>::full([3], backend.rank() as f32 + 1.0);
//!             backend.all_reduce_sum(&t).unwrap()
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     assert_eq!(h.join().unwrap().data(), &[3.0; 3]);
//! }
//! ```

pub mod backend;
pub mod cpu_backend;
pub mod data_parallel;
pub mod ring;
pub mod ring_attention;
pub mod topology;
pub mod transport;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use data_parallel::{DataParallel, NoSyncGuard};
pub use ring::{Completed, RingComm, Ticket};
pub use ring_attention::{
    RingAttentionConfig, RingAttentionFn, RingChannels, RingGrads, RingOutput, RingSaved,
    ring_attention_backward, ring_attention_forward,
};
pub use topology::{ParallelConfig, ProcessGrid, RingTopology};
pub use transport::{Frame, GridEndpoints, LocalEndpoint, LocalRing, RingTransport};
