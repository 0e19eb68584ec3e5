//! Core Tensor implementation.
//!
//! A `Tensor` is a flat, row-major buffer plus a fixed-rank shape. Everything the ring engine moves
//! between workers (query/key/value blocks, partial outputs, gradient accumulators) is a
//! `Tensor<T, 4>` laid out as `[batch, heads, seq, head_dim]`.
//!
//! ```rust
//! use ringtrain::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.strides(), &[3, 1]);
//! ```

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod device;
pub mod ops;
pub mod storage;

pub use device::{Cpu, Device};
pub use ops::TensorOps;
pub use storage::Storage;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

impl From<ringtrain_kernels::KernelError> for TensorError {
    fn from(e: ringtrain_kernels::KernelError) -> Self {
        match e {
            ringtrain_kernels::KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            ringtrain_kernels::KernelError::InvalidArgument(msg) => TensorError::Unsupported(msg),
        }
    }
}

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync` is required because kernels run on `rayon`; `ToPrimitive`/`FromPrimitive` let the
/// ring engine carry partial results in `f64` regardless of the compute type.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// An N-dimensional array.
///
/// - `T`: the element type.
/// - `RANK`: number of dimensions, fixed at compile time. Sizes stay dynamic so one model can run
///   with any batch or sequence length.
/// - `D`: where the data lives (defaults to [`Cpu`]).
#[derive(Clone)]
pub struct Tensor<T, const RANK: usize, D: Device = Cpu>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: D::Storage<T>,
    device: D,
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
            device: Cpu,
        })
    }

    /// Creates a tensor whose element at flat index `i` is `f(i)`.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: (0..size).map(f).collect(),
            device: Cpu,
        }
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
            device: Cpu,
        }
    }

    /// Reshapes the tensor to a new shape with the same number of elements.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the element counts differ.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK, Cpu>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
            device: self.device,
        })
    }

    /// Consumes the tensor and returns its flat buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Converts every element to another numeric type.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` if an element is not representable in `U`.
    pub fn cast<U: TensorElem>(&self) -> Result<Tensor<U, RANK, Cpu>> {
        let data = self
            .data
            .iter()
            .map(|x| x.to_f64().and_then(U::from_f64))
            .collect::<Option<Vec<U>>>()
            .ok_or_else(|| TensorError::Unsupported("element cast out of range".into()))?;
        Tensor::new(data, self.shape)
    }

    /// Returns `true` if every element is neither NaN nor infinite.
    pub fn all_finite(&self) -> bool {
        self.data
            .iter()
            .all(|x| x.to_f64().is_some_and(f64::is_finite))
    }
}

/// Row-major strides for `shape`.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize, D: Device> Tensor<T, RANK, D>
where
    T: TensorElem,
{
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the underlying data as a flat slice.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns the underlying data as a mutable flat slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Total number of elements.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<T, const RANK: usize, D: Device> Debug for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device.name())
            .field("data_len", &self.data.len())
            .finish()
    }
}
