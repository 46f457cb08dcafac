//! Tensor operations.
//!
//! Element-wise arithmetic, batched matrix multiplication and the layout
//! operations the distributed layer is built from:
//!
//! - `transpose` / `transpose_axes`: physically permute two axes.
//! - `narrow`: copy a contiguous range along one axis (one shard).
//! - `chunk`: split an axis into equal parts (the shards of every worker).
//! - `Tensor::cat`: the inverse of `chunk`.
//!
//! Element-wise operations require identical shapes; there is no implicit
//! broadcasting. Broadcasting that the attention stack needs (a bias over the
//! last axis, a per-row dropout mask) is spelled out as dedicated methods.
//!
//! # Examples
//!
//! ```rust
//! use evoformer_rs::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Cpu, Device, Result, Tensor, TensorElem, TensorError, compute_strides, shape_array};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// Shapes must match exactly; the work is split across the `rayon` pool.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_map(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use evoformer_rs::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let data = self.data.par_iter().map(|&x| f(x)).collect();
        self.with_data(data)
    }

    /// Combines two tensors of the same shape element by element.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        let data = self
            .data
            .par_iter()
            .zip(rhs.data.par_iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(self.with_data(data))
    }

    /// Adds `bias` to every vector along the last axis.
    pub fn add_last_axis(&self, bias: &Tensor<T, 1, Cpu>) -> Result<Self> {
        let width = self.shape[RANK - 1];
        if bias.shape[0] != width {
            return Err(TensorError::ShapeMismatch {
                expected: vec![width],
                got: bias.shape.to_vec(),
            });
        }
        let mut out = self.clone();
        if width > 0 {
            out.data.par_chunks_mut(width).for_each(|row| {
                for (o, &b) in row.iter_mut().zip(bias.data.iter()) {
                    *o += b;
                }
            });
        }
        Ok(out)
    }

    /// Matrix Multiplication over the last two axes.
    ///
    /// Leading axes are batch axes and must agree:
    /// `[..., M, K] x [..., K, N] -> [..., M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        if self.shape[..RANK - 2] != rhs.shape[..RANK - 2] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];

        let out_data = evoformer_rs_kernels::cpu_matmul(
            self.data.as_slice(),
            rhs.data.as_slice(),
            &self.shape,
            &rhs.shape,
        )?;

        Tensor::new(out_data, out_shape)
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> Result<Self> {
        let data = Cpu::transpose(&self.data, &self.shape)?;
        let mut shape = self.shape;
        shape.swap(RANK - 1, RANK - 2);
        Tensor::new(data, shape)
    }

    /// Swaps two axes of the tensor, moving the data into the new layout.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `ax1` or `ax2` are out of bounds.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let data = Cpu::swap_axes(&self.data, &self.shape, ax1, ax2)?;
        let mut shape = self.shape;
        shape.swap(ax1, ax2);
        Tensor::new(data, shape)
    }

    /// Copies `len` entries of axis `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let data = evoformer_rs_kernels::cpu_narrow(&self.data, &self.shape, dim, start, len)?;
        let mut shape = self.shape;
        shape[dim] = len;
        Tensor::new(data, shape)
    }

    /// Splits axis `dim` into `parts` equal, contiguous pieces.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the axis length is not a
    /// multiple of `parts`.
    pub fn chunk(&self, parts: usize, dim: usize) -> Result<Vec<Self>> {
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: self.shape.to_vec(),
            });
        }
        let size = self.shape[dim];
        if parts == 0 || size % parts != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![parts],
                got: vec![size],
            });
        }
        let len = size / parts;
        (0..parts)
            .map(|i| self.narrow(dim, i * len, len))
            .collect()
    }

    /// Concatenates tensors along axis `dim`, in the order given.
    ///
    /// All other axes must agree.
    pub fn cat(parts: &[Self], dim: usize) -> Result<Self> {
        let views: Vec<(&[T], &[usize])> = parts
            .iter()
            .map(|t| (t.data.as_slice(), t.shape.as_slice()))
            .collect();
        let (data, shape) = evoformer_rs_kernels::cpu_concat(&views, dim)?;
        Tensor::new(data, shape_array(shape)?)
    }

    /// A tensor with this shape and the given data.
    ///
    /// Only used internally where the length is known to match.
    fn with_data(&self, data: Vec<T>) -> Self {
        Tensor {
            shape: self.shape,
            strides: compute_strides(&self.shape),
            data,
            device: Cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota<const RANK: usize>(shape: [usize; RANK]) -> Tensor<f32, RANK> {
        let size: usize = shape.iter().product();
        Tensor::new((0..size).map(|i| i as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&b - &a).unwrap().data(), &[2.0, 2.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b / &a).unwrap().data(), &[3.0, 2.0]);

        let c = Tensor::<f32, 1>::zeros([3]);
        assert!(matches!(&a + &c, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_map() {
        let t = Tensor::<f32, 1>::new(vec![1.0, -2.0], [2]).unwrap();
        assert_eq!(t.map(|x| x * 2.0).data(), &[2.0, -4.0]);
    }

    #[test]
    fn test_add_last_axis() {
        let t = iota([2, 3]);
        let bias = Tensor::<f32, 1>::new(vec![10.0, 20.0, 30.0], [3]).unwrap();
        let out = t.add_last_axis(&bias).unwrap();
        assert_eq!(out.data(), &[10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);

        let wrong = Tensor::<f32, 1>::zeros([2]);
        assert!(t.add_last_axis(&wrong).is_err());
    }

    #[test]
    fn test_matmul_2d() {
        // [[1, 2], [3, 4]] x [[5, 6], [7, 8]]
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![5.0, 6.0, 7.0, 8.0], [2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_4d() {
        let a = Tensor::<f32, 4>::ones([2, 3, 4, 5]);
        let b = Tensor::<f32, 4>::ones([2, 3, 5, 6]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 4, 6]);
        assert!(c.data().iter().all(|&x| x == 5.0));
    }

    #[test]
    fn test_matmul_batch_mismatch() {
        let a = Tensor::<f32, 3>::zeros([2, 2, 2]);
        let b = Tensor::<f32, 3>::zeros([3, 2, 2]);
        assert!(matches!(a.matmul(&b), Err(TensorError::ShapeMismatch { .. })));

        let c = Tensor::<f32, 3>::zeros([2, 3, 2]);
        assert!(matches!(c.matmul(&c), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_transpose() {
        let t = iota([2, 3]);
        let tt = t.transpose().unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_transpose_axes() {
        // [1, 2, 2, 2] swap(1, 2)
        let t = iota([1, 2, 2, 2]);
        let out = t.transpose_axes(1, 2).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        assert_eq!(out.data(), &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);

        let back = out.transpose_axes(2, 1).unwrap();
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn test_transpose_axes_identity_and_error() {
        let t = iota([2, 3]);
        assert_eq!(t.transpose_axes(1, 1).unwrap().data(), t.data());
        assert!(matches!(
            t.transpose_axes(0, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_narrow() {
        let t = iota([2, 4]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2]);
        assert_eq!(n.data(), &[1.0, 2.0, 5.0, 6.0]);

        assert!(matches!(
            t.narrow(1, 3, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_chunk_and_cat() {
        let t = iota([2, 6, 3]);
        let parts = t.chunk(3, 1).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].shape(), &[2, 2, 3]);
        assert_eq!(parts[1].data()[0], 6.0);

        let joined = Tensor::cat(&parts, 1).unwrap();
        assert_eq!(joined.shape(), t.shape());
        assert_eq!(joined.data(), t.data());
    }

    #[test]
    fn test_chunk_indivisible() {
        let t = iota([2, 5]);
        assert!(matches!(t.chunk(2, 1), Err(TensorError::ShapeMismatch { .. })));
        assert!(t.chunk(0, 1).is_err());
        assert!(matches!(
            t.chunk(1, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_cat_mismatch() {
        let a = Tensor::<f32, 2>::zeros([2, 2]);
        let b = Tensor::<f32, 2>::zeros([3, 3]);
        assert!(Tensor::cat(&[a, b], 0).is_err());
        assert!(Tensor::<f32, 2>::cat(&[], 0).is_err());
    }
}
