//! Core Tensor implementation.
//!
//! A `Tensor` is a row-major N-dimensional array: a flat buffer of elements, a
//! shape and the matching strides. The rank is a const generic, so an MSA
//! activation is a `Tensor<f32, 4>` (`[batch, rows, cols, channels]`) and its
//! mask a `Tensor<f32, 3>` (`[batch, rows, cols]`); the sizes of each axis are
//! runtime values, which is what sharding needs (a shard has the same rank as
//! the full tensor but a smaller extent along one axis).
//!
//! ```rust
//! use evoformer_rs::tensor::Tensor;
//!
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f32, 2>::new(data, [2, 3]).unwrap();
//!
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.strides(), &[3, 1]);
//! ```
//!
//! All tensors are contiguous. Operations that change layout (`transpose`,
//! `transpose_axes`, `narrow`, `cat`) physically move data through the
//! `evoformer-rs-kernels` crate, so the flat data of a result is always in
//! row-major order of its own shape.

use evoformer_rs_kernels::KernelError;
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod device;
pub mod ops;
pub mod storage;

pub use device::{Cpu, Device};
pub use storage::Storage;

/// Error type for every fallible operation in the crate.
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
    /// An axis cannot be split evenly across the worker group.
    #[error("Cannot shard axis {dim} of size {size} across {world_size} workers")]
    IndivisibleShard {
        dim: usize,
        size: usize,
        world_size: usize,
    },
    /// A rank outside `0..world_size`.
    #[error("Rank {rank} is not a member of a group of size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
    /// A peer hung up or sent something that does not fit the collective.
    #[error("Communication failure: {0}")]
    Communication(String),
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<KernelError> for TensorError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::AxisOutOfRange { axis, rank } => TensorError::IndexOutOfBounds {
                index: vec![axis],
                shape: vec![rank],
            },
            KernelError::SliceOutOfRange { start, end, size } => TensorError::IndexOutOfBounds {
                index: vec![start, end],
                shape: vec![size],
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync` is required because kernels run on the `rayon` pool and
/// shards cross thread boundaries in the CPU collective backend.
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

/// Converts an `f64` constant (an epsilon, a scale, a mask bias) into `T`.
pub fn cast<T: TensorElem>(value: f64) -> Result<T> {
    T::from_f64(value).ok_or_else(|| {
        TensorError::Unsupported(format!("{value} is not representable in the element type"))
    })
}

/// Converts a runtime shape back into a fixed-rank shape.
pub(crate) fn shape_array<const RANK: usize>(shape: Vec<usize>) -> Result<[usize; RANK]> {
    let got = shape.clone();
    <[usize; RANK]>::try_from(shape).map_err(|_| TensorError::ShapeMismatch {
        expected: vec![RANK],
        got,
    })
}

/// The core Tensor struct.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
/// - `D`: The device where data is stored (defaults to `Cpu`).
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

    /// Creates a Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
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

    /// Consumes the tensor and returns its flat row-major buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Largest absolute element-wise difference to `other`.
    ///
    /// Used to compare the outputs of sharded and single-worker runs.
    pub fn max_abs_diff(&self, other: &Self) -> Result<f64> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| {
                let a = a.to_f64().unwrap_or(f64::NAN);
                let b = b.to_f64().unwrap_or(f64::NAN);
                (a - b).abs()
            })
            .fold(0.0, f64::max))
    }
}

/// Computes row-major strides for a given shape.
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
    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the row-major strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns the underlying data as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
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
