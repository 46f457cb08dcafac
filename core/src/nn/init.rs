//! Seeded parameter initialisation.
//!
//! Initialisers draw from a caller-provided RNG, so every worker of a group
//! that seeds its RNG identically builds bit-identical weights.

use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use rand::Rng;

/// How a parameter tensor is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Uniform with variance `1 / fan_in`.
    Lecun,
    /// Uniform with the given standard deviation.
    Std(f64),
    Zeros,
    Ones,
}

impl Init {
    /// Builds a tensor of `shape` filled according to `self`.
    pub fn tensor<T, const RANK: usize, R>(
        self,
        shape: [usize; RANK],
        fan_in: usize,
        rng: &mut R,
    ) -> Result<Tensor<T, RANK, Cpu>>
    where
        T: TensorElem,
        R: Rng + ?Sized,
    {
        let std = match self {
            Init::Zeros => return Ok(Tensor::zeros(shape)),
            Init::Ones => return Ok(Tensor::ones(shape)),
            Init::Lecun => {
                if fan_in == 0 {
                    return Err(TensorError::Config("fan_in must be positive".into()));
                }
                1.0 / (fan_in as f64).sqrt()
            }
            Init::Std(std) => std,
        };
        if std.is_nan() || std <= 0.0 {
            return Ok(Tensor::zeros(shape));
        }

        // A uniform distribution on [-a, a] has standard deviation a / sqrt(3).
        let bound = std * 3f64.sqrt();
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| {
                let x = rng.random_range(-bound..bound);
                T::from_f64(x).ok_or_else(|| {
                    TensorError::Unsupported(format!("{x} is not representable"))
                })
            })
            .collect::<Result<Vec<T>>>()?;
        Tensor::new(data, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_constant_inits() {
        let mut rng = StdRng::seed_from_u64(0);
        let z: Tensor<f32, 2> = Init::Zeros.tensor([2, 2], 2, &mut rng).unwrap();
        let o: Tensor<f32, 1> = Init::Ones.tensor([3], 3, &mut rng).unwrap();
        assert_eq!(z.data(), &[0.0; 4]);
        assert_eq!(o.data(), &[1.0; 3]);
    }

    #[test]
    fn test_lecun_bounds_and_seeding() {
        let mut rng = StdRng::seed_from_u64(42);
        let a: Tensor<f32, 2> = Init::Lecun.tensor([16, 12], 12, &mut rng).unwrap();
        let bound = (3.0f32 / 12.0).sqrt();
        assert!(a.data().iter().all(|x| x.abs() <= bound));
        assert!(a.data().iter().any(|&x| x != 0.0));

        let mut rng = StdRng::seed_from_u64(42);
        let b: Tensor<f32, 2> = Init::Lecun.tensor([16, 12], 12, &mut rng).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_lecun_rejects_zero_fan_in() {
        let mut rng = StdRng::seed_from_u64(0);
        let r: Result<Tensor<f32, 1>> = Init::Lecun.tensor([1], 0, &mut rng);
        assert!(r.is_err());
    }
}
