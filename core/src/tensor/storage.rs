//! Storage abstraction for Tensors.
//!
//! A `Tensor` keeps shape and strides; the `Storage` holds the elements. Storage must expose its
//! contents as a contiguous slice, which is what kernels and the ring transport consume.

use crate::tensor::TensorElem;
use std::fmt::Debug;

/// The container behind a tensor.
pub trait Storage<T>: Clone + Debug + Send + Sync {
    fn as_slice(&self) -> &[T];

    fn as_mut_slice(&mut self) -> &mut [T];

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the storage with `src`, which must have the same length.
    fn copy_from_slice(&mut self, src: &[T])
    where
        T: Copy,
    {
        self.as_mut_slice().copy_from_slice(src);
    }
}

impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
    fn len(&self) -> usize {
        Vec::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_storage() {
        let mut storage = vec![1.0, 2.0, 3.0];
        assert_eq!(storage.as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(Storage::len(&storage), 3);
        assert!(!Storage::is_empty(&storage));

        storage.as_mut_slice()[0] = 10.0;
        Storage::copy_from_slice(&mut storage, &[4.0, 5.0, 6.0]);
        assert_eq!(storage.as_slice(), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_storage() {
        let storage: Vec<f32> = vec![];
        assert!(Storage::is_empty(&storage));
    }
}
