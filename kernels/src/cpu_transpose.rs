use crate::{KernelElem, Result};
use rayon::prelude::*;

/// Swaps the last two axes of row-major data: `[..., M, N] -> [..., N, M]`.
///
/// Each output row gathers one input column, so rows are filled in parallel.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    crate::check_len(data, shape)?;
    let m = shape[RANK - 2];
    let n = shape[RANK - 1];

    let mut out = vec![T::zero(); data.len()];
    if m == 0 || n == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(m).enumerate().for_each(|(row, out_row)| {
        let base = (row / n) * m * n;
        let col = row % n;
        for (r, slot) in out_row.iter_mut().enumerate() {
            *slot = data[base + r * n + col];
        }
    });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;

    #[test]
    fn test_transpose_matrix() {
        // [1 2 3]    [1 4]
        // [4 5 6] -> [2 5]
        //            [3 6]
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = cpu_transpose(&data, &[2, 3]).unwrap();
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_batched() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let out = cpu_transpose(&data, &[2, 2, 2]).unwrap();
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0]);
    }

    #[test]
    fn test_transpose_len_mismatch() {
        let data = vec![1.0, 2.0];
        let err = cpu_transpose(&data, &[2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
