use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Swaps two arbitrary axes of row-major data.
///
/// Works for any rank. The output is materialised contiguously in the new
/// layout: output rows (runs along the last output axis) are filled in
/// parallel, each starting from an input offset decoded from the row index.
pub fn cpu_swap_axes<T: KernelElem>(
    data: &[T],
    shape: &[usize],
    ax1: usize,
    ax2: usize,
) -> Result<Vec<T>> {
    let rank = shape.len();
    for axis in [ax1, ax2] {
        if axis >= rank {
            return Err(KernelError::AxisOutOfRange { axis, rank });
        }
    }
    crate::check_len(data, shape)?;
    if ax1 == ax2 || data.is_empty() {
        return Ok(data.to_vec());
    }

    let mut in_strides = vec![1usize; rank];
    for i in (0..rank - 1).rev() {
        in_strides[i] = in_strides[i + 1] * shape[i + 1];
    }

    let mut out_shape = shape.to_vec();
    out_shape.swap(ax1, ax2);
    // Stride in the input for a unit step along each output axis.
    let mut step = in_strides.clone();
    step.swap(ax1, ax2);

    let last = out_shape[rank - 1];
    let last_step = step[rank - 1];
    let lead_shape = &out_shape[..rank - 1];
    let lead_step = &step[..rank - 1];

    let mut out = vec![T::zero(); data.len()];
    out.par_chunks_mut(last).enumerate().for_each(|(row, out_row)| {
        let mut rem = row;
        let mut offset = 0;
        for d in (0..lead_shape.len()).rev() {
            offset += (rem % lead_shape[d]) * lead_step[d];
            rem /= lead_shape[d];
        }
        for (j, slot) in out_row.iter_mut().enumerate() {
            *slot = data[offset + j * last_step];
        }
    });

    Ok(out)
}
