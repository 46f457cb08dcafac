use crate::nn::module::{Module, ParamVisitor, ParamVisitorMut, visit_tensor, visit_tensor_mut};
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError, cast};
use num_traits::Float;
use rayon::prelude::*;

/// Layer Normalization over the last axis.
///
/// Formula: `y = (x - mean) / sqrt(var + eps) * gamma + beta`
#[derive(Debug, Clone)]
pub struct LayerNorm<T: TensorElem> {
    pub weight: Tensor<T, 1, Cpu>,
    pub bias: Tensor<T, 1, Cpu>,
    pub eps: T,
}

impl<T: TensorElem + Float> LayerNorm<T> {
    /// Creates a new LayerNorm layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - The scale weights (gamma) of shape `[features]`.
    /// * `bias` - The shift weights (beta) of shape `[features]`.
    /// * `eps` - A small constant for numerical stability.
    pub fn new(weight: Tensor<T, 1, Cpu>, bias: Tensor<T, 1, Cpu>, eps: T) -> Result<Self> {
        if weight.shape() != bias.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        Ok(Self { weight, bias, eps })
    }

    /// Identity-initialised layer norm (`gamma = 1`, `beta = 0`).
    pub fn init(features: usize, eps: f64) -> Result<Self> {
        Self::new(Tensor::ones([features]), Tensor::zeros([features]), cast(eps)?)
    }

    /// Normalizes the input over the last dimension.
    pub fn forward<const RANK: usize>(
        &self,
        x: &Tensor<T, RANK, Cpu>,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let shape = x.shape();
        let last_dim = shape[RANK - 1];
        if last_dim != self.weight.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.weight.shape()[0]],
                got: vec![last_dim],
            });
        }

        let mut out = Tensor::zeros(*shape);
        if last_dim == 0 {
            return Ok(out);
        }
        let n: T = cast(last_dim as f64)?;
        let weight = self.weight.data();
        let bias = self.bias.data();

        out.data_mut()
            .par_chunks_mut(last_dim)
            .zip(x.data().par_chunks(last_dim))
            .for_each(|(out_row, in_row)| {
                let mut sum = T::zero();
                for &val in in_row {
                    sum += val;
                }
                let mean = sum / n;

                let mut sum_sq_diff = T::zero();
                for &val in in_row {
                    let diff = val - mean;
                    sum_sq_diff += diff * diff;
                }
                let rstd = T::one() / (sum_sq_diff / n + self.eps).sqrt();

                for i in 0..last_dim {
                    out_row[i] = (in_row[i] - mean) * rstd * weight[i] + bias[i];
                }
            });

        Ok(out)
    }
}

impl<T: TensorElem> Module<T> for LayerNorm<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        visit_tensor(prefix, "weight", &self.weight, f);
        visit_tensor(prefix, "bias", &self.bias, f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        visit_tensor_mut(prefix, "weight", &mut self.weight, f)?;
        visit_tensor_mut(prefix, "bias", &mut self.bias, f)
    }
}
