use crate::{KernelElem, KernelError, Result};

/// Copies `data[..., start..start + len, ...]` along `axis`.
///
/// The tensor is viewed as `[outer, axis_len, inner]`; each outer block
/// contributes one contiguous run of `len * inner` elements.
pub fn cpu_narrow<T: KernelElem>(
    data: &[T],
    shape: &[usize],
    axis: usize,
    start: usize,
    len: usize,
) -> Result<Vec<T>> {
    crate::check_len(data, shape)?;
    let (outer, axis_len, inner) = crate::split_at_axis(shape, axis)?;
    let end = start + len;
    if end > axis_len {
        return Err(KernelError::SliceOutOfRange {
            start,
            end,
            size: axis_len,
        });
    }

    let mut out = Vec::with_capacity(outer * len * inner);
    for block in 0..outer {
        let base = block * axis_len * inner;
        out.extend_from_slice(&data[base + start * inner..base + end * inner]);
    }
    Ok(out)
}

/// Concatenates row-major parts along `axis`.
///
/// All parts must agree on every axis except `axis`. Parts are laid out in the
/// order given, so the caller decides the global ordering.
pub fn cpu_concat<T: KernelElem>(
    parts: &[(&[T], &[usize])],
    axis: usize,
) -> Result<(Vec<T>, Vec<usize>)> {
    let Some(&(_, first_shape)) = parts.first() else {
        return Err(KernelError::ShapeMismatch {
            expected: vec![1],
            got: vec![0],
        });
    };
    let rank = first_shape.len();
    if axis >= rank {
        return Err(KernelError::AxisOutOfRange { axis, rank });
    }

    let mut out_shape = first_shape.to_vec();
    out_shape[axis] = 0;
    for &(data, shape) in parts {
        crate::check_len(data, shape)?;
        let agrees = shape.len() == rank
            && shape
                .iter()
                .zip(first_shape)
                .enumerate()
                .all(|(d, (a, b))| d == axis || a == b);
        if !agrees {
            return Err(KernelError::ShapeMismatch {
                expected: first_shape.to_vec(),
                got: shape.to_vec(),
            });
        }
        out_shape[axis] += shape[axis];
    }

    let (outer, _, inner) = crate::split_at_axis(&out_shape, axis)?;
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for block in 0..outer {
        for &(data, shape) in parts {
            let run = shape[axis] * inner;
            out.extend_from_slice(&data[block * run..(block + 1) * run]);
        }
    }
    Ok((out, out_shape))
}
