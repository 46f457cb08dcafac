use crate::nn::init::Init;
use crate::nn::module::{Module, ParamVisitor, ParamVisitorMut, visit_tensor, visit_tensor_mut};
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use rand::Rng;

/// Linear Layer: `y = xA^T + b`
///
/// Applies to the last axis of an input of any rank: `[..., in] -> [..., out]`.
/// Leading axes are flattened into rows, so a `[B, S, R, C]` MSA activation
/// is projected as one `[B * S * R, C]` matrix.
///
/// # Examples
/// ```rust
/// use evoformer_rs::nn::Linear;
/// use evoformer_rs::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::ones([2, 3]), Some(Tensor::zeros([2]))).unwrap();
/// let x = Tensor::<f32, 3>::ones([4, 5, 3]);
/// let y = layer.forward(&x).unwrap();
/// assert_eq!(y.shape(), &[4, 5, 2]);
/// assert!(y.data().iter().all(|&v| v == 3.0));
/// ```
#[derive(Debug, Clone)]
pub struct Linear<T: TensorElem> {
    /// Shape: `[out_features, in_features]`
    pub weight: Tensor<T, 2, Cpu>,
    /// Shape: `[out_features]`
    pub bias: Option<Tensor<T, 1, Cpu>>,
}

impl<T: TensorElem> Linear<T> {
    /// Creates a new Linear layer.
    ///
    /// # Errors
    ///
    /// `TensorError::ShapeMismatch` if the bias length differs from the
    /// weight's output dimension.
    pub fn new(weight: Tensor<T, 2, Cpu>, bias: Option<Tensor<T, 1, Cpu>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.shape()[0] != weight.shape()[0] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                });
            }
        }
        Ok(Self { weight, bias })
    }

    /// Creates a randomly initialised layer.
    ///
    /// `bias_init` of `None` builds a layer without bias.
    pub fn init<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        weight_init: Init,
        bias_init: Option<Init>,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = weight_init.tensor([out_features, in_features], in_features, rng)?;
        let bias = bias_init
            .map(|init| init.tensor([out_features], in_features, rng))
            .transpose()?;
        Self::new(weight, bias)
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Projects the last axis of `x`.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK, Cpu>) -> Result<Tensor<T, RANK, Cpu>> {
        let in_features = self.in_features();
        let shape = *x.shape();
        if shape[RANK - 1] != in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![in_features],
                got: vec![shape[RANK - 1]],
            });
        }

        let rows = if in_features == 0 { 0 } else { x.size() / in_features };
        let flat = x.clone().reshape([rows, in_features])?;
        let mut out = flat.matmul(&self.weight.transpose()?)?;
        if let Some(bias) = &self.bias {
            out = out.add_last_axis(bias)?;
        }

        let mut out_shape = shape;
        out_shape[RANK - 1] = self.out_features();
        out.reshape(out_shape)
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        visit_tensor(prefix, "weight", &self.weight, f);
        if let Some(bias) = &self.bias {
            visit_tensor(prefix, "bias", bias, f);
        }
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        visit_tensor_mut(prefix, "weight", &mut self.weight, f)?;
        if let Some(bias) = &mut self.bias {
            visit_tensor_mut(prefix, "bias", bias, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_linear_forward_2d() {
        // W = [[1, 2], [3, 4], [5, 6]], b = [1, 1, 1]
        let weight = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap();
        let layer = Linear::new(weight, Some(Tensor::ones([3]))).unwrap();
        let x = Tensor::<f32, 2>::new(vec![1.0, 1.0, 2.0, 0.0], [2, 2]).unwrap();

        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.data(), &[4.0, 8.0, 12.0, 3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_linear_forward_4d_matches_rows() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::<f32>::init(4, 5, Init::Lecun, Some(Init::Lecun), &mut rng).unwrap();
        let x: Tensor<f32, 4> = Init::Std(1.0).tensor([2, 3, 2, 4], 4, &mut rng).unwrap();

        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3, 2, 5]);

        // Each output row only depends on its input row.
        let row: Tensor<f32, 2> = x.narrow(1, 1, 1).unwrap().reshape([2 * 2, 4]).unwrap();
        let y_row = layer.forward(&row).unwrap();
        let expected = y.narrow(1, 1, 1).unwrap();
        assert_eq!(y_row.data(), expected.data());
    }

    #[test]
    fn test_linear_without_bias() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::<f32>::init(3, 2, Init::Ones, None, &mut rng).unwrap();
        assert!(layer.bias.is_none());
        assert_eq!(layer.num_parameters(), 6);

        let y = layer.forward(&Tensor::<f32, 1>::ones([3])).unwrap();
        assert_eq!(y.data(), &[3.0, 3.0]);
    }

    #[test]
    fn test_linear_shape_errors() {
        let layer = Linear::<f32>::new(Tensor::zeros([2, 3]), None).unwrap();
        assert!(layer.forward(&Tensor::<f32, 2>::zeros([4, 2])).is_err());
        assert!(Linear::<f32>::new(Tensor::zeros([2, 3]), Some(Tensor::zeros([3]))).is_err());
    }

    #[test]
    fn test_linear_parameter_names() {
        let layer = Linear::<f32>::new(Tensor::zeros([2, 3]), Some(Tensor::zeros([2]))).unwrap();
        let mut names = Vec::new();
        layer.visit_parameters("proj", &mut |name, _, _| names.push(name.to_string()));
        assert_eq!(names, vec!["proj.weight", "proj.bias"]);
    }
}
