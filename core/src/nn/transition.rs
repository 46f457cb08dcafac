use crate::nn::activation::Activation;
use crate::nn::init::Init;
use crate::nn::module::{Module, ParamVisitor, ParamVisitorMut, param_name};
use crate::nn::{LayerNorm, Linear};
use crate::tensor::{Cpu, Result, Tensor, TensorElem};
use num_traits::Float;
use rand::Rng;

/// Position-wise feed-forward block with a residual connection.
///
/// `x + linear2(relu(linear1(norm(x))))`, with a hidden width of
/// `factor * d`.
#[derive(Debug, Clone)]
pub struct Transition<T: TensorElem> {
    pub norm: LayerNorm<T>,
    pub linear1: Linear<T>,
    pub linear2: Linear<T>,
}

impl<T: TensorElem + Float> Transition<T> {
    pub fn init<R: Rng + ?Sized>(d: usize, factor: usize, eps: f64, rng: &mut R) -> Result<Self> {
        Ok(Self {
            norm: LayerNorm::init(d, eps)?,
            linear1: Linear::init(d, factor * d, Init::Lecun, Some(Init::Zeros), rng)?,
            linear2: Linear::init(factor * d, d, Init::Lecun, Some(Init::Zeros), rng)?,
        })
    }

    pub fn forward<const RANK: usize>(
        &self,
        x: &Tensor<T, RANK, Cpu>,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let hidden = Activation::relu(&self.linear1.forward(&self.norm.forward(x)?)?);
        let update = self.linear2.forward(&hidden)?;
        x + &update
    }
}

impl<T: TensorElem> Module<T> for Transition<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.norm.visit_parameters(&param_name(prefix, "norm"), f);
        self.linear1.visit_parameters(&param_name(prefix, "linear1"), f);
        self.linear2.visit_parameters(&param_name(prefix, "linear2"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.norm.visit_parameters_mut(&param_name(prefix, "norm"), f)?;
        self.linear1
            .visit_parameters_mut(&param_name(prefix, "linear1"), f)?;
        self.linear2
            .visit_parameters_mut(&param_name(prefix, "linear2"), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_transition_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let t = Transition::<f32>::init(4, 4, 1e-5, &mut rng).unwrap();
        let x: Tensor<f32, 4> = Init::Std(1.0).tensor([1, 2, 3, 4], 1, &mut rng).unwrap();
        let y = t.forward(&x).unwrap();
        assert_eq!(y.shape(), x.shape());
        assert!(y.max_abs_diff(&x).unwrap() > 0.0);
        // norm: 8, linear1: 16 * 4 + 16, linear2: 4 * 16 + 4
        assert_eq!(t.num_parameters(), 8 + 80 + 68);
    }

    #[test]
    fn test_zero_update_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut t = Transition::<f32>::init(4, 2, 1e-5, &mut rng).unwrap();
        t.linear2.weight = Tensor::zeros([4, 8]);

        let x: Tensor<f32, 3> = Init::Std(1.0).tensor([2, 3, 4], 1, &mut rng).unwrap();
        let y = t.forward(&x).unwrap();
        assert_eq!(y.data(), x.data());
    }
}
