//! Dropout as an explicit, seeded policy.
//!
//! Nothing here reads a global training flag: every forward pass receives a
//! [`DropoutMode`]. At inference no mask is built and dropout is the
//! identity. In training the mask is a pure function of the seed and the
//! mask shape, so every worker that is handed the same seed builds the same
//! mask.

use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError, cast, compute_strides};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Whether a forward pass applies dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropoutMode {
    #[default]
    Inference,
    Training { seed: u64 },
}

/// Inverted dropout with drop probability `rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    pub rate: f64,
}

impl Dropout {
    /// # Errors
    ///
    /// `TensorError::Config` unless `0 <= rate < 1`.
    pub fn new(rate: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(TensorError::Config(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self { rate })
    }

    /// Builds the keep-mask for `shape`: each entry is `0` with probability
    /// `rate` and `1 / (1 - rate)` otherwise.
    ///
    /// Returns `None` at inference or when `rate` is zero.
    pub fn mask<T: TensorElem, const RANK: usize>(
        &self,
        shape: [usize; RANK],
        mode: DropoutMode,
    ) -> Result<Option<Tensor<T, RANK, Cpu>>> {
        let DropoutMode::Training { seed } = mode else {
            return Ok(None);
        };
        if self.rate == 0.0 {
            return Ok(None);
        }

        let keep: T = cast(1.0 / (1.0 - self.rate))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| {
                if rng.random_bool(self.rate) {
                    T::zero()
                } else {
                    keep
                }
            })
            .collect();
        Ok(Some(Tensor::new(data, shape)?))
    }
}

/// Strides of `src` as seen from `out`: 0 on broadcast (size 1) axes.
fn broadcast_strides<const RANK: usize>(
    out: &[usize; RANK],
    src: &[usize; RANK],
) -> Result<[usize; RANK]> {
    let mut strides = compute_strides(src);
    for axis in 0..RANK {
        if src[axis] == 1 && out[axis] != 1 {
            strides[axis] = 0;
        } else if src[axis] != out[axis] {
            return Err(TensorError::ShapeMismatch {
                expected: out.to_vec(),
                got: src.to_vec(),
            });
        }
    }
    Ok(strides)
}

/// Fused bias + dropout + residual add: `(x + bias) * mask + residual`.
///
/// `bias` is added along the last axis. `mask` may have size-1 axes that are
/// broadcast against `x` (the row-attention mask is `[B, 1, R, C]`); without
/// a mask (inference) the result is `x + bias + residual`.
pub fn bias_dropout_add<T: TensorElem, const RANK: usize>(
    x: &Tensor<T, RANK, Cpu>,
    bias: &Tensor<T, 1, Cpu>,
    mask: Option<&Tensor<T, RANK, Cpu>>,
    residual: &Tensor<T, RANK, Cpu>,
) -> Result<Tensor<T, RANK, Cpu>> {
    if x.shape() != residual.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: x.shape().to_vec(),
            got: residual.shape().to_vec(),
        });
    }
    let mut out = x.add_last_axis(bias)?;

    if let Some(mask) = mask {
        let shape = *out.shape();
        let out_strides = compute_strides(&shape);
        let mask_strides = broadcast_strides(&shape, mask.shape())?;
        let mask_data = mask.data();
        out.data_mut().par_iter_mut().enumerate().for_each(|(i, o)| {
            let mut rem = i;
            let mut offset = 0;
            for axis in 0..RANK {
                offset += (rem / out_strides[axis]) * mask_strides[axis];
                rem %= out_strides[axis];
            }
            *o *= mask_data[offset];
        });
    }

    &out + residual
}
