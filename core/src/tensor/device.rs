//! Device abstraction for Tensor storage.
//!
//! A device decides where tensor data lives and which kernels move it around.
//! Every worker in a model-parallel group owns its own shards in host memory,
//! so `Cpu` is the only device; the collective backend (see
//! [`crate::distributed`]) is what moves data *between* workers.

use crate::tensor::{Result, Storage, TensorElem, TensorError};
use std::fmt::Debug;

/// A trait representing the underlying storage device for a Tensor.
///
/// The `Storage` associated type lets each device pick its own container
/// (`Vec<T>` on the CPU).
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Returns the name of the device.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use evoformer_rs::tensor::{Cpu, Device};
    /// let device = Cpu;
    /// assert_eq!(device.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;

    /// Swaps the last two axes of the data.
    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> Result<Self::Storage<T>>;

    /// Swaps two arbitrary axes of the data.
    fn swap_axes<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
        ax1: usize,
        ax2: usize,
    ) -> Result<Self::Storage<T>>;
}

/// A CPU Device.
///
/// Data is stored in system RAM using `Vec<T>`; kernels are parallelised with `rayon`.
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
    ) -> Result<Self::Storage<T>> {
        if RANK < 2 {
            return Err(TensorError::Unsupported(
                "Transpose requires rank >= 2".into(),
            ));
        }
        Ok(evoformer_rs_kernels::cpu_transpose(data, shape)?)
    }

    fn swap_axes<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
        ax1: usize,
        ax2: usize,
    ) -> Result<Self::Storage<T>> {
        Ok(evoformer_rs_kernels::cpu_swap_axes(data, shape, ax1, ax2)?)
    }
}
