//! Activation Functions.
//!
//! - **ReLU**: `max(0, x)`, the transition block's non-linearity.
//! - **Sigmoid**: `1 / (1 + e^-x)`, used for the attention output gates.

use crate::tensor::{Cpu, Tensor, TensorElem};
use num_traits::Float;

/// Computes the ReLU activation function.
pub fn relu<T: TensorElem>(x: T) -> T {
    if x > T::zero() { x } else { T::zero() }
}

/// Computes the logistic sigmoid.
pub fn sigmoid<T: TensorElem + Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// Activation functions namespace.
///
/// Provides element-wise activation functions for Tensors.
pub struct Activation;

impl Activation {
    /// Applies ReLU element-wise to a tensor.
    pub fn relu<const RANK: usize, T: TensorElem>(x: &Tensor<T, RANK, Cpu>) -> Tensor<T, RANK, Cpu> {
        x.map(relu)
    }

    /// Applies the sigmoid element-wise to a tensor.
    pub fn sigmoid<const RANK: usize, T: TensorElem + Float>(
        x: &Tensor<T, RANK, Cpu>,
    ) -> Tensor<T, RANK, Cpu> {
        x.map(sigmoid)
    }
}
