//! Slice-level CPU kernels for `ringtrain`.
//!
//! Every kernel here works on flat row-major slices plus an explicit shape, so the tensor crate can
//! swap them for an accelerated implementation without touching call sites.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_attention;
pub mod cpu_matmul;
pub mod cpu_transpose;

pub use cpu_attention::{
    attention_block_backward, attention_block_forward, BlockGrads, BlockOutput, BlockShape,
};
pub use cpu_matmul::{cpu_matmul, cpu_matmul_nt};
pub use cpu_transpose::cpu_transpose;

/// Number of elements above which kernels fan out over `rayon`.
pub const PARALLEL_THRESHOLD: usize = 4096;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid kernel argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

pub(crate) fn check_len(name: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(KernelError::InvalidArgument(format!(
            "{name}: expected {expected} elements, got {got}"
        )));
    }
    Ok(())
}
