//! Crate-level error type.
//!
//! Tensor-shaped failures stay in [`TensorError`] and convert into [`Error`] with `?`. Everything
//! distributed is fatal: no call site retries, because ring peers cannot replay a step they have
//! already moved past.

use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Shape, index or rank problems from tensor code (including a received buffer whose shape does
    /// not match what the receiver expected).
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// Ranks disagree on the world size or on the order of calls on a channel.
    #[error("Topology mismatch: {0}")]
    Topology(String),

    /// A peer went away or a channel was closed mid-exchange.
    #[error("Communication failure on channel `{channel}`: {reason}")]
    Comm { channel: String, reason: String },

    /// A merge or reduction produced NaN or infinity.
    #[error("Non-finite value produced by {op}")]
    NonFinite { op: &'static str },

    /// Invalid user configuration (world size, head counts, ...).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Misuse of the autograd graph.
    #[error("Autograd error: {0}")]
    Autograd(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ringtrain_kernels::KernelError> for Error {
    fn from(e: ringtrain_kernels::KernelError) -> Self {
        Error::Tensor(e.into())
    }
}
