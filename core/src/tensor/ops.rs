//! Tensor operations.
//!
//! Element-wise arithmetic (`+ - * /` on `&Tensor`, exact shape match required), matrix products
//! delegated to `ringtrain_kernels`, and the layout operations attention needs: axis swaps,
//! slicing along a dimension and concatenation. Large element-wise loops run on `rayon`.
//!
//! ```rust
//! use ringtrain::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Cpu, Device, Result, Tensor, TensorElem, TensorError, compute_strides};

use ringtrain_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements an element-wise binary operator for `&Tensor`, returning `Result` on shape mismatch.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_map(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Operations whose implementation depends on the device.
pub trait TensorOps<T: TensorElem, const RANK: usize>: Sized {
    /// Swaps the last two dimensions.
    fn transpose(&self) -> Result<Self>;
}

impl<T, const RANK: usize, D: Device> TensorOps<T, RANK> for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn transpose(&self) -> Result<Self> {
        let data = D::transpose(&self.data, &self.shape)?;

        let mut shape = self.shape;
        shape.swap(RANK - 1, RANK - 2);

        Ok(Tensor {
            shape,
            strides: compute_strides(&shape),
            data,
            device: self.device.clone(),
        })
    }
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies `f` to every element.
    ///
    /// ```rust
    /// use ringtrain::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        if self.size() >= PARALLEL_THRESHOLD {
            out.data
                .par_iter_mut()
                .zip(self.data.par_iter())
                .for_each(|(o, &x)| *o = f(x));
        } else {
            for (o, &x) in out.data.iter_mut().zip(&self.data) {
                *o = f(x);
            }
        }
        out
    }

    /// Combines two equally-shaped tensors element by element.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let mut out = Tensor::zeros(self.shape);
        if self.size() >= PARALLEL_THRESHOLD {
            out.data
                .par_iter_mut()
                .zip(self.data.par_iter())
                .zip(rhs.data.par_iter())
                .for_each(|((o, &a), &b)| *o = f(a, b));
        } else {
            for ((o, &a), &b) in out.data.iter_mut().zip(&self.data).zip(&rhs.data) {
                *o = f(a, b);
            }
        }
        Ok(out)
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Batched matrix product over the last two dimensions: `[..., M, K] x [..., K, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let data = ringtrain_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        let mut shape = self.shape;
        shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(data, shape)
    }

    /// Batched `self · rhsᵀ` with `rhs` laid out as `[..., N, K]`.
    pub fn matmul_nt(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let data =
            ringtrain_kernels::cpu_matmul_nt(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        let mut shape = self.shape;
        shape[RANK - 1] = rhs.shape[RANK - 2];
        Tensor::new(data, shape)
    }

    /// Swaps two axes, physically permuting the data so the result stays contiguous.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if either axis is `>= RANK`.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape;
        new_shape.swap(ax1, ax2);
        let out_strides = compute_strides(&new_shape);

        // Input stride seen from each output axis.
        let mut in_strides = self.strides;
        in_strides.swap(ax1, ax2);

        let src = &self.data;
        let gather = |(idx, o): (usize, &mut T)| {
            let mut rem = idx;
            let mut offset = 0;
            for d in 0..RANK {
                let coord = rem / out_strides[d];
                rem %= out_strides[d];
                offset += coord * in_strides[d];
            }
            *o = src[offset];
        };

        let mut out = Tensor::zeros(new_shape);
        if self.size() >= PARALLEL_THRESHOLD {
            out.data.par_iter_mut().enumerate().for_each(gather);
        } else {
            out.data.iter_mut().enumerate().for_each(gather);
        }
        Ok(out)
    }

    /// Returns the slice `start..start + len` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        if dim >= RANK || start + len > self.shape[dim] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim, start + len],
                shape: self.shape.to_vec(),
            });
        }

        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        let row = self.shape[dim] * inner;

        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * row + start * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }

        let mut shape = self.shape;
        shape[dim] = len;
        Tensor::new(data, shape)
    }
}
