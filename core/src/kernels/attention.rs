use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rayon::prelude::*;

pub const PARALLEL_THRESHOLD: usize = 4096;

/// Projected inputs of one gated multi-head attention call.
///
/// Every activation is `[B, G, L, H * D]`: `G` independent groups (MSA rows or
/// columns) of `L` positions that attend to each other.
#[derive(Debug)]
pub struct GatedAttentionInputs<'a, T: TensorElem> {
    /// Queries, already multiplied by the scaling factor.
    pub q: &'a Tensor<T, 4, Cpu>,
    pub k: &'a Tensor<T, 4, Cpu>,
    pub v: &'a Tensor<T, 4, Cpu>,
    /// Gate values in `[0, 1]` (post-sigmoid).
    pub gate: &'a Tensor<T, 4, Cpu>,
    /// `[B, G, L]`, 1 for real positions and 0 for padding.
    pub mask: &'a Tensor<T, 3, Cpu>,
    /// Optional `[B, H, L, L]` bias shared by every group of a batch element.
    pub pair_bias: Option<&'a Tensor<T, 4, Cpu>>,
}

fn check_shape<const RANK: usize>(
    got: &[usize; RANK],
    expected: [usize; RANK],
) -> Result<()> {
    if *got != expected {
        return Err(TensorError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// Numerically stable in-place softmax.
fn softmax_in_place<T: TensorElem + Float>(logits: &mut [T]) {
    let max = logits
        .iter()
        .copied()
        .fold(T::neg_infinity(), |acc, x| if x > acc { x } else { acc });
    let mut sum = T::zero();
    for x in logits.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in logits.iter_mut() {
        *x /= sum;
    }
}

/// Fused gated multi-head attention.
///
/// For every group, head `h` and query `i`:
///
/// ```text
/// logits[j] = q[i] . k[j] + inf * (mask[j] - 1) + pair_bias[h, i, j]
/// out[i]    = gate[i] * sum_j softmax(logits)[j] * v[j]
/// ```
///
/// Groups are processed independently (in parallel above
/// `PARALLEL_THRESHOLD`) and each group's arithmetic is fixed, so the result
/// for a group does not depend on which other groups are in the batch.
pub fn fused_gated_attention<T: TensorElem + Float>(
    inputs: &GatedAttentionInputs<'_, T>,
    n_head: usize,
    inf: T,
) -> Result<Tensor<T, 4, Cpu>> {
    let [b, g, l, hd] = *inputs.q.shape();
    if n_head == 0 || hd % n_head != 0 {
        return Err(TensorError::ShapeMismatch {
            expected: vec![n_head],
            got: vec![hd],
        });
    }
    let d = hd / n_head;

    check_shape(inputs.k.shape(), [b, g, l, hd])?;
    check_shape(inputs.v.shape(), [b, g, l, hd])?;
    check_shape(inputs.gate.shape(), [b, g, l, hd])?;
    check_shape(inputs.mask.shape(), [b, g, l])?;
    if let Some(bias) = inputs.pair_bias {
        check_shape(bias.shape(), [b, n_head, l, l])?;
    }

    let mut output = Tensor::zeros([b, g, l, hd]);
    let group_len = l * hd;
    if group_len == 0 || b * g == 0 {
        return Ok(output);
    }

    let q_data = inputs.q.data();
    let k_data = inputs.k.data();
    let v_data = inputs.v.data();
    let gate_data = inputs.gate.data();
    let mask_data = inputs.mask.data();
    let bias_data = inputs.pair_bias.map(|t| t.data());

    let group_fn = |(idx, out_group): (usize, &mut [T])| {
        let batch = idx / g;
        let base = idx * group_len;
        let mask = &mask_data[idx * l..(idx + 1) * l];
        let mut logits = vec![T::zero(); l];

        for h in 0..n_head {
            for i in 0..l {
                let q_row = &q_data[base + i * hd + h * d..base + i * hd + (h + 1) * d];
                for (j, logit) in logits.iter_mut().enumerate() {
                    let k_row = &k_data[base + j * hd + h * d..base + j * hd + (h + 1) * d];
                    let mut dot = T::zero();
                    for (&qv, &kv) in q_row.iter().zip(k_row) {
                        dot += qv * kv;
                    }
                    dot += inf * (mask[j] - T::one());
                    if let Some(bias) = bias_data {
                        dot += bias[((batch * n_head + h) * l + i) * l + j];
                    }
                    *logit = dot;
                }
                softmax_in_place(&mut logits);

                let out_row = &mut out_group[i * hd + h * d..i * hd + (h + 1) * d];
                for (j, &w) in logits.iter().enumerate() {
                    let v_row = &v_data[base + j * hd + h * d..base + j * hd + (h + 1) * d];
                    for (o, &vv) in out_row.iter_mut().zip(v_row) {
                        *o += w * vv;
                    }
                }
                let gate_row = &gate_data[base + i * hd + h * d..base + i * hd + (h + 1) * d];
                for (o, &gv) in out_row.iter_mut().zip(gate_row) {
                    *o *= gv;
                }
            }
        }
    };

    if b * g * group_len >= PARALLEL_THRESHOLD {
        output
            .data_mut()
            .par_chunks_mut(group_len)
            .enumerate()
            .for_each(group_fn);
    } else {
        output
            .data_mut()
            .chunks_mut(group_len)
            .enumerate()
            .for_each(group_fn);
    }

    Ok(output)
}

/// Projected inputs of one global attention call.
///
/// The `L` positions of each group share a single averaged query per head,
/// and keys/values have a single head.
#[derive(Debug)]
pub struct GlobalAttentionInputs<'a, T: TensorElem> {
    /// `[B, G, H * D]`, already multiplied by the scaling factor.
    pub q: &'a Tensor<T, 3, Cpu>,
    /// `[B, G, L, D]`
    pub k: &'a Tensor<T, 4, Cpu>,
    /// `[B, G, L, D]`
    pub v: &'a Tensor<T, 4, Cpu>,
    /// `[B, G, L, H * D]`, post-sigmoid.
    pub gate: &'a Tensor<T, 4, Cpu>,
    /// `[B, G, L]`
    pub mask: &'a Tensor<T, 3, Cpu>,
}

/// Fused global attention.
///
/// For every group and head `h`:
///
/// ```text
/// logits[j] = q[h] . k[j] + inf * (mask[j] - 1)
/// avg[h]    = sum_j softmax(logits)[j] * v[j]
/// out[l, h] = gate[l, h] * avg[h]
/// ```
pub fn fused_global_attention<T: TensorElem + Float>(
    inputs: &GlobalAttentionInputs<'_, T>,
    n_head: usize,
    inf: T,
) -> Result<Tensor<T, 4, Cpu>> {
    let [b, g, l, d] = *inputs.k.shape();
    let hd = n_head * d;

    check_shape(inputs.q.shape(), [b, g, hd])?;
    check_shape(inputs.v.shape(), [b, g, l, d])?;
    check_shape(inputs.gate.shape(), [b, g, l, hd])?;
    check_shape(inputs.mask.shape(), [b, g, l])?;

    let mut output = Tensor::zeros([b, g, l, hd]);
    let group_len = l * hd;
    if group_len == 0 || b * g == 0 {
        return Ok(output);
    }

    let q_data = inputs.q.data();
    let k_data = inputs.k.data();
    let v_data = inputs.v.data();
    let gate_data = inputs.gate.data();
    let mask_data = inputs.mask.data();

    let group_fn = |(idx, out_group): (usize, &mut [T])| {
        let kv_base = idx * l * d;
        let mask = &mask_data[idx * l..(idx + 1) * l];
        let mut logits = vec![T::zero(); l];
        let mut avg = vec![T::zero(); hd];

        for h in 0..n_head {
            let q_row = &q_data[idx * hd + h * d..idx * hd + (h + 1) * d];
            for (j, logit) in logits.iter_mut().enumerate() {
                let k_row = &k_data[kv_base + j * d..kv_base + (j + 1) * d];
                let mut dot = T::zero();
                for (&qv, &kv) in q_row.iter().zip(k_row) {
                    dot += qv * kv;
                }
                *logit = dot + inf * (mask[j] - T::one());
            }
            softmax_in_place(&mut logits);

            let avg_row = &mut avg[h * d..(h + 1) * d];
            for (j, &w) in logits.iter().enumerate() {
                let v_row = &v_data[kv_base + j * d..kv_base + (j + 1) * d];
                for (a, &vv) in avg_row.iter_mut().zip(v_row) {
                    *a += w * vv;
                }
            }
        }

        let gate_group = &gate_data[idx * group_len..(idx + 1) * group_len];
        for ((o, &gv), &a) in out_group
            .iter_mut()
            .zip(gate_group)
            .zip(avg.iter().cycle())
        {
            *o = gv * a;
        }
    };

    if b * g * group_len >= PARALLEL_THRESHOLD {
        output
            .data_mut()
            .par_chunks_mut(group_len)
            .enumerate()
            .for_each(group_fn);
    } else {
        output
            .data_mut()
            .chunks_mut(group_len)
            .enumerate()
            .for_each(group_fn);
    }

    Ok(output)
}
