use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Batched matrix multiplication over the last two axes.
///
/// `lhs` is `[..., M, K]`, `rhs` is `[..., K, N]` and the leading (batch) axes
/// must already agree; the caller checks them. The result is `[..., M, N]`.
///
/// The right-hand side is transposed once up front so that every output element
/// is a dot product of two contiguous rows. Output rows are independent and are
/// filled in parallel. Each dot product accumulates in index order, so results
/// do not depend on how many rows are in the batch.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 1];

    if rhs_shape[RANK - 2] != k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }
    crate::check_len(lhs_data, lhs_shape)?;
    crate::check_len(rhs_data, rhs_shape)?;

    let batches: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out = vec![T::zero(); batches * m * n];
    if n == 0 || m == 0 {
        return Ok(out);
    }

    // [..., K, N] -> [..., N, K]
    let rhs_t = crate::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out.par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let batch = row / m;
            let lhs_start = row * k;
            let lhs_row = &lhs_data[lhs_start..lhs_start + k];
            let rhs_batch = &rhs_t[batch * n * k..(batch + 1) * n * k];

            for (col, slot) in out_row.iter_mut().enumerate() {
                let rhs_row = &rhs_batch[col * k..(col + 1) * k];
                let mut acc = T::zero();
                for (&a, &b) in lhs_row.iter().zip(rhs_row) {
                    acc += a * b;
                }
                *slot = acc;
            }
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_square() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];

        let out = cpu_matmul(&a, &b, &[2, 2], &[2, 2]).unwrap();
        // [1 2] [5 6]   [19 22]
        // [3 4] [7 8] = [43 50]
        assert_eq!(out, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [1, 3] x [3, 2]
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];

        let out = cpu_matmul(&a, &b, &[1, 3], &[3, 2]).unwrap();
        assert_eq!(out, vec![4.0, 5.0]);
    }

    #[test]
    fn test_matmul_batched() {
        let a = vec![
            1.0, 0.0, 0.0, 1.0, // I
            0.0, 1.0, 1.0, 0.0, // swap
        ];
        let b = vec![
            1.0, 2.0, 3.0, 4.0, //
            1.0, 2.0, 3.0, 4.0, //
        ];

        let out = cpu_matmul(&a, &b, &[2, 2, 2], &[2, 2, 2]).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = vec![1.0; 4];
        let b = vec![1.0; 6];

        let err = cpu_matmul(&a, &b, &[2, 2], &[3, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_data_len_mismatch() {
        let a = vec![1.0; 3];
        let b = vec![1.0; 4];

        let err = cpu_matmul(&a, &b, &[2, 2], &[2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
