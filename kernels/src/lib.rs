//! Flat-slice CPU kernels used by `evoformer-rs` tensors.
//!
//! Every kernel works on row-major data plus an explicit shape and returns a
//! freshly allocated `Vec<T>`. Keeping them free of the `Tensor` type lets the
//! core crate swap in a BLAS or accelerator backend without touching callers.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_matmul;
pub mod cpu_permute;
pub mod cpu_slice;
pub mod cpu_transpose;

pub use cpu_matmul::cpu_matmul;
pub use cpu_permute::cpu_swap_axes;
pub use cpu_slice::{cpu_concat, cpu_narrow};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },
    #[error("Slice {start}..{end} out of range for axis of size {size}")]
    SliceOutOfRange {
        start: usize,
        end: usize,
        size: usize,
    },
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

/// Splits `shape` around `axis` into `(outer, axis_len, inner)` element counts.
///
/// Any row-major tensor can be viewed as `[outer, axis_len, inner]`, which is
/// all the slicing kernels need.
pub(crate) fn split_at_axis(shape: &[usize], axis: usize) -> Result<(usize, usize, usize)> {
    if axis >= shape.len() {
        return Err(KernelError::AxisOutOfRange {
            axis,
            rank: shape.len(),
        });
    }
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    Ok((outer, shape[axis], inner))
}

pub(crate) fn check_len<T>(data: &[T], shape: &[usize]) -> Result<()> {
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    Ok(())
}
