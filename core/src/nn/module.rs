use crate::tensor::{Cpu, Result, Tensor, TensorElem};
use std::fmt::Debug;

/// Visitor over read-only parameters: `(name, shape, data)`.
pub type ParamVisitor<'a, T> = dyn FnMut(&str, &[usize], &[T]) + 'a;

/// Visitor over mutable parameters: `(name, shape, data)`.
pub type ParamVisitorMut<'a, T> = dyn FnMut(&str, &[usize], &mut [T]) -> Result<()> + 'a;

/// A Module trait for Neural Network layers.
///
/// Besides the `Debug + Send + Sync` bounds every layer shares (parameters
/// are read concurrently by all workers of a group), a module exposes its
/// parameters by name. Names are dotted paths built from field names
/// (`row_attention.attention.to_qkv.weight`), which is what checkpoints are
/// keyed by.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    /// Calls `f` once per parameter, in a fixed order.
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>);

    /// Calls `f` once per parameter with mutable access, in the same order as
    /// `visit_parameters`. Stops at the first error.
    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        let mut count = 0;
        self.visit_parameters("", &mut |_, _, data| count += data.len());
        count
    }
}

/// Joins a parent prefix and a field name into a dotted parameter name.
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Visits a single tensor parameter.
pub(crate) fn visit_tensor<T: TensorElem, const RANK: usize>(
    prefix: &str,
    name: &str,
    tensor: &Tensor<T, RANK, Cpu>,
    f: &mut ParamVisitor<'_, T>,
) {
    f(&param_name(prefix, name), tensor.shape(), tensor.data());
}

/// Visits a single tensor parameter mutably.
pub(crate) fn visit_tensor_mut<T: TensorElem, const RANK: usize>(
    prefix: &str,
    name: &str,
    tensor: &mut Tensor<T, RANK, Cpu>,
    f: &mut ParamVisitorMut<'_, T>,
) -> Result<()> {
    let shape = *tensor.shape();
    f(&param_name(prefix, name), &shape, tensor.data_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Scale {
        weight: Tensor<f32, 1, Cpu>,
    }

    impl Module<f32> for Scale {
        fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, f32>) {
            visit_tensor(prefix, "weight", &self.weight, f);
        }

        fn visit_parameters_mut(
            &mut self,
            prefix: &str,
            f: &mut ParamVisitorMut<'_, f32>,
        ) -> Result<()> {
            visit_tensor_mut(prefix, "weight", &mut self.weight, f)
        }
    }

    #[test]
    fn test_param_name() {
        assert_eq!(param_name("", "weight"), "weight");
        assert_eq!(param_name("norm", "weight"), "norm.weight");
    }

    #[test]
    fn test_visitors() {
        let mut module = Scale {
            weight: Tensor::ones([3]),
        };
        assert_eq!(module.num_parameters(), 3);

        let mut names = Vec::new();
        module.visit_parameters("layer", &mut |name, shape, _| {
            names.push((name.to_string(), shape.to_vec()))
        });
        assert_eq!(names, vec![("layer.weight".to_string(), vec![3])]);

        module
            .visit_parameters_mut("", &mut |_, _, data| {
                data.iter_mut().for_each(|x| *x = 2.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(module.weight.data(), &[2.0; 3]);
    }
}
