//! Gated multi-head attention layers.
//!
//! Both layers work on `[B, G, L, D]` activations: `G` independent groups of
//! `L` positions. For MSA row attention the groups are sequences and the
//! positions residues; column attention transposes its input first so the
//! groups are residues and the positions sequences.

use crate::distributed::{AsyncGather, CollectiveBackend};
use crate::kernels::{
    GatedAttentionInputs, GlobalAttentionInputs, fused_gated_attention, fused_global_attention,
};
use crate::nn::activation::Activation;
use crate::nn::init::Init;
use crate::nn::module::{Module, ParamVisitor, ParamVisitorMut, param_name};
use crate::nn::Linear;
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError, cast};
use num_traits::Float;
use rand::Rng;
use rayon::prelude::*;

const MEAN_EPS: f64 = 1e-10;

/// Projected queries, keys, values and gates of one forward pass.
struct Projected<T: TensorElem> {
    q: Tensor<T, 4, Cpu>,
    k: Tensor<T, 4, Cpu>,
    v: Tensor<T, 4, Cpu>,
    gate: Tensor<T, 4, Cpu>,
}

/// Multi-head self-attention with an output gate.
///
/// ```text
/// q, k, v = split(to_qkv(x))
/// o       = softmax(q k^T / sqrt(c) + mask_bias + pair_bias) v
/// out     = o_linear(sigmoid(gating_linear(x)) * o)
/// ```
///
/// With `output_bias = false` the final projection has no bias; the owning
/// layer adds it itself (fused with dropout and the residual).
#[derive(Debug, Clone)]
pub struct SelfAttention<T: TensorElem> {
    pub to_qkv: Linear<T>,
    pub gating_linear: Linear<T>,
    pub o_linear: Linear<T>,
    pub n_head: usize,
    pub c: usize,
    pub scaling: T,
    pub inf: T,
}

impl<T: TensorElem + Float> SelfAttention<T> {
    /// Randomly initialised attention mapping `qkv_dim` to `out_dim` channels.
    ///
    /// The gate starts open-ish (zero weights, unit bias, `sigmoid(1)`).
    pub fn init<R: Rng + ?Sized>(
        qkv_dim: usize,
        c: usize,
        n_head: usize,
        out_dim: usize,
        output_bias: bool,
        inf: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let hc = n_head * c;
        let to_qkv = Linear::init(qkv_dim, 3 * hc, Init::Lecun, None, rng)?;
        let gating_linear = Linear::init(qkv_dim, hc, Init::Zeros, Some(Init::Ones), rng)?;
        let o_linear = Linear::init(hc, out_dim, Init::Lecun, output_bias.then_some(Init::Zeros), rng)?;
        Ok(Self {
            to_qkv,
            gating_linear,
            o_linear,
            n_head,
            c,
            scaling: cast(1.0 / (c as f64).sqrt())?,
            inf: cast(inf)?,
        })
    }

    fn project(&self, x: &Tensor<T, 4, Cpu>) -> Result<Projected<T>> {
        let hc = self.n_head * self.c;
        let qkv = self.to_qkv.forward(x)?;
        let scaling = self.scaling;
        Ok(Projected {
            q: qkv.narrow(3, 0, hc)?.map(|v| v * scaling),
            k: qkv.narrow(3, hc, hc)?,
            v: qkv.narrow(3, 2 * hc, hc)?,
            gate: Activation::sigmoid(&self.gating_linear.forward(x)?),
        })
    }

    fn attend(
        &self,
        projected: &Projected<T>,
        mask: &Tensor<T, 3, Cpu>,
        pair_bias: Option<&Tensor<T, 4, Cpu>>,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let inputs = GatedAttentionInputs {
            q: &projected.q,
            k: &projected.k,
            v: &projected.v,
            gate: &projected.gate,
            mask,
            pair_bias,
        };
        let weighted = fused_gated_attention(&inputs, self.n_head, self.inf)?;
        self.o_linear.forward(&weighted)
    }

    /// Attention over axis 2 of `x: [B, G, L, D]` with key mask `[B, G, L]`.
    pub fn forward(
        &self,
        x: &Tensor<T, 4, Cpu>,
        mask: &Tensor<T, 3, Cpu>,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let projected = self.project(x)?;
        self.attend(&projected, mask, None)
    }

    /// Like [`forward`](Self::forward), with an additive bias that is still
    /// being gathered.
    ///
    /// The projections run first; the gather is waited on only when the
    /// attention logits need it. The gathered tensor is in pair layout
    /// `[B, L, L, H]` (query, key, head) and is shared by all groups.
    pub fn forward_with_pair_bias<B: CollectiveBackend>(
        &self,
        x: &Tensor<T, 4, Cpu>,
        mask: &Tensor<T, 3, Cpu>,
        pair_bias: AsyncGather<'_, B, T, 4>,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let projected = self.project(x)?;
        // [B, Q, K, H] -> [B, Q, H, K] -> [B, H, Q, K]
        let bias = pair_bias.wait()?.transpose_axes(2, 3)?.transpose_axes(1, 2)?;
        self.attend(&projected, mask, Some(&bias))
    }
}

impl<T: TensorElem> Module<T> for SelfAttention<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.to_qkv.visit_parameters(&param_name(prefix, "to_qkv"), f);
        self.gating_linear
            .visit_parameters(&param_name(prefix, "gating_linear"), f);
        self.o_linear.visit_parameters(&param_name(prefix, "o_linear"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.to_qkv
            .visit_parameters_mut(&param_name(prefix, "to_qkv"), f)?;
        self.gating_linear
            .visit_parameters_mut(&param_name(prefix, "gating_linear"), f)?;
        self.o_linear
            .visit_parameters_mut(&param_name(prefix, "o_linear"), f)
    }
}

/// Global attention: one query per group and head, averaged over the
/// (masked) positions, attending to single-head keys and values.
///
/// Cost is linear in `L`, which is what makes it usable over the very deep
/// extra MSA.
#[derive(Debug, Clone)]
pub struct GlobalAttention<T: TensorElem> {
    pub to_q: Linear<T>,
    pub to_kv: Linear<T>,
    pub gating_linear: Linear<T>,
    pub o_linear: Linear<T>,
    pub n_head: usize,
    pub c: usize,
    pub scaling: T,
    pub inf: T,
}

impl<T: TensorElem + Float> GlobalAttention<T> {
    pub fn init<R: Rng + ?Sized>(
        qkv_dim: usize,
        c: usize,
        n_head: usize,
        out_dim: usize,
        inf: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let hc = n_head * c;
        Ok(Self {
            to_q: Linear::init(qkv_dim, hc, Init::Lecun, None, rng)?,
            to_kv: Linear::init(qkv_dim, 2 * c, Init::Lecun, None, rng)?,
            gating_linear: Linear::init(qkv_dim, hc, Init::Zeros, Some(Init::Ones), rng)?,
            o_linear: Linear::init(hc, out_dim, Init::Lecun, Some(Init::Zeros), rng)?,
            n_head,
            c,
            scaling: cast(1.0 / (c as f64).sqrt())?,
            inf: cast(inf)?,
        })
    }

    /// Mask-weighted mean of `x` over axis 2: `[B, G, L, D] -> [B, G, D]`.
    fn masked_mean(
        &self,
        x: &Tensor<T, 4, Cpu>,
        mask: &Tensor<T, 3, Cpu>,
    ) -> Result<Tensor<T, 3, Cpu>> {
        let [b, g, l, d] = *x.shape();
        if *mask.shape() != [b, g, l] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![b, g, l],
                got: mask.shape().to_vec(),
            });
        }
        let eps: T = cast(MEAN_EPS)?;
        let mut out = Tensor::zeros([b, g, d]);
        if d == 0 {
            return Ok(out);
        }

        let x_data = x.data();
        let mask_data = mask.data();
        out.data_mut()
            .par_chunks_mut(d)
            .enumerate()
            .for_each(|(idx, row)| {
                let mut denom = T::zero();
                for j in 0..l {
                    let m = mask_data[idx * l + j];
                    denom += m;
                    let x_row = &x_data[(idx * l + j) * d..(idx * l + j + 1) * d];
                    for (o, &xv) in row.iter_mut().zip(x_row) {
                        *o += xv * m;
                    }
                }
                denom += eps;
                for o in row.iter_mut() {
                    *o /= denom;
                }
            });
        Ok(out)
    }

    /// Global attention over axis 2 of `x: [B, G, L, D]` with mask `[B, G, L]`.
    pub fn forward(
        &self,
        x: &Tensor<T, 4, Cpu>,
        mask: &Tensor<T, 3, Cpu>,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let scaling = self.scaling;
        let q = self
            .to_q
            .forward(&self.masked_mean(x, mask)?)?
            .map(|v| v * scaling);
        let kv = self.to_kv.forward(x)?;
        let k = kv.narrow(3, 0, self.c)?;
        let v = kv.narrow(3, self.c, self.c)?;
        let gate = Activation::sigmoid(&self.gating_linear.forward(x)?);

        let inputs = GlobalAttentionInputs {
            q: &q,
            k: &k,
            v: &v,
            gate: &gate,
            mask,
        };
        let weighted = fused_global_attention(&inputs, self.n_head, self.inf)?;
        self.o_linear.forward(&weighted)
    }
}

impl<T: TensorElem> Module<T> for GlobalAttention<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.to_q.visit_parameters(&param_name(prefix, "to_q"), f);
        self.to_kv.visit_parameters(&param_name(prefix, "to_kv"), f);
        self.gating_linear
            .visit_parameters(&param_name(prefix, "gating_linear"), f);
        self.o_linear.visit_parameters(&param_name(prefix, "o_linear"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.to_q.visit_parameters_mut(&param_name(prefix, "to_q"), f)?;
        self.to_kv
            .visit_parameters_mut(&param_name(prefix, "to_kv"), f)?;
        self.gating_linear
            .visit_parameters_mut(&param_name(prefix, "gating_linear"), f)?;
        self.o_linear
            .visit_parameters_mut(&param_name(prefix, "o_linear"), f)
    }
}
