//! Device abstraction for Tensor storage.
//!
//! A device decides where tensor data is allocated and which kernels run on it. Only [`Cpu`] exists
//! today; collectives and the ring transport move data as host buffers.

use crate::tensor::{Storage, TensorElem};
use std::fmt::Debug;

/// The storage device of a Tensor.
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The memory container used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Human-readable device name.
    ///
    /// ```rust
    /// use ringtrain::tensor::{Cpu, Device};
    /// assert_eq!(Cpu.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;

    /// Swaps the last two dimensions of `data`.
    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>>;
}

/// Host memory, parallelized with `rayon`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Vec<T>
    where
        T: TensorElem;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>> {
        Ok(ringtrain_kernels::cpu_transpose(data, shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorError;

    #[test]
    fn test_cpu_device_name() {
        assert_eq!(Cpu.name(), "CPU");
        assert_eq!(format!("{:?}", Cpu), "Cpu");
    }

    #[test]
    fn test_cpu_transpose_error() {
        let result = Cpu::transpose(&vec![1.0], &[1]);
        assert!(matches!(result, Err(TensorError::Unsupported(_))));
    }

    #[test]
    fn test_cpu_transpose_mismatch() {
        let result = Cpu::transpose(&vec![1.0, 2.0], &[2, 2]);
        assert!(matches!(result, Err(TensorError::ShapeMismatch { .. })));
    }
}
