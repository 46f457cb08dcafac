//! MSA row and column attention blocks.
//!
//! Row attention runs on the row-sharded MSA (`[B, S / w, R, C]`) and takes
//! its per-head bias from the column-sharded pair representation
//! (`[B, R / w, R, D_pair]`). Column attention runs on the column-sharded MSA
//! (`[B, S, R / w, C]`). Neither communicates except for the pair-bias gather.

use super::config::MsaStackConfig;
use crate::distributed::{CollectiveBackend, ROW_DIM, gather_async};
use crate::nn::module::{
    Module, ParamVisitor, ParamVisitorMut, param_name, visit_tensor, visit_tensor_mut,
};
use crate::nn::{
    Dropout, DropoutMode, GlobalAttention, Init, LayerNorm, Linear, SelfAttention,
    bias_dropout_add,
};
use crate::tensor::{Cpu, Result, Tensor, TensorElem};
use num_traits::Float;
use rand::Rng;
use tracing::trace;

/// Row-wise gated self-attention with a bias projected from the pair
/// representation.
#[derive(Debug, Clone)]
pub struct MsaRowAttentionWithPairBias<T: TensorElem> {
    pub layernorm_m: LayerNorm<T>,
    pub layernorm_z: LayerNorm<T>,
    /// `[row_heads, d_pair]`, no bias.
    pub linear_b: Linear<T>,
    pub attention: SelfAttention<T>,
    /// Output bias of `attention`, applied in `bias_dropout_add`.
    pub out_bias: Tensor<T, 1, Cpu>,
    pub dropout: Dropout,
}

impl<T: TensorElem + Float> MsaRowAttentionWithPairBias<T> {
    pub fn init<R: Rng + ?Sized>(config: &MsaStackConfig, rng: &mut R) -> Result<Self> {
        let eps = config.layer_norm_eps;
        let pair_std = 1.0 / (config.d_pair as f64).sqrt();
        Ok(Self {
            layernorm_m: LayerNorm::init(config.d_node, eps)?,
            layernorm_z: LayerNorm::init(config.d_pair, eps)?,
            linear_b: Linear::init(config.d_pair, config.row_heads, Init::Std(pair_std), None, rng)?,
            attention: SelfAttention::init(
                config.d_node,
                config.row_c,
                config.row_heads,
                config.d_node,
                false,
                config.inf,
                rng,
            )?,
            out_bias: Tensor::zeros([config.d_node]),
            dropout: Dropout::new(config.p_drop)?,
        })
    }

    /// Updates the row-sharded MSA `m: [B, S / w, R, C]`.
    ///
    /// `z` is this rank's column shard of the pair representation and `mask`
    /// the row-sharded MSA mask `[B, S / w, R]`. The pair bias is projected
    /// locally and gathered asynchronously while the attention projections
    /// of `m` run.
    pub fn forward<B: CollectiveBackend>(
        &self,
        backend: &B,
        m: &Tensor<T, 4, Cpu>,
        z: &Tensor<T, 4, Cpu>,
        mask: &Tensor<T, 3, Cpu>,
        mode: DropoutMode,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let m_norm = self.layernorm_m.forward(m)?;
        let z_norm = self.layernorm_z.forward(z)?;

        // [B, R / w, R, H], gathered to [B, R, R, H]
        let bias_shard = self.linear_b.forward(&z_norm)?;
        trace!(rank = backend.rank(), shape = ?bias_shard.shape(), "posting pair bias gather");
        let pair_bias = gather_async(backend, &bias_shard, ROW_DIM)?;

        let out = self
            .attention
            .forward_with_pair_bias(&m_norm, mask, pair_bias)?;

        let [b, _, r, c] = *m.shape();
        let dropout_mask = self.dropout.mask([b, 1, r, c], mode)?;
        bias_dropout_add(&out, &self.out_bias, dropout_mask.as_ref(), m)
    }
}

impl<T: TensorElem> Module<T> for MsaRowAttentionWithPairBias<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.layernorm_m
            .visit_parameters(&param_name(prefix, "layernorm_m"), f);
        self.layernorm_z
            .visit_parameters(&param_name(prefix, "layernorm_z"), f);
        self.linear_b.visit_parameters(&param_name(prefix, "linear_b"), f);
        self.attention
            .visit_parameters(&param_name(prefix, "attention"), f);
        visit_tensor(prefix, "out_bias", &self.out_bias, f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.layernorm_m
            .visit_parameters_mut(&param_name(prefix, "layernorm_m"), f)?;
        self.layernorm_z
            .visit_parameters_mut(&param_name(prefix, "layernorm_z"), f)?;
        self.linear_b
            .visit_parameters_mut(&param_name(prefix, "linear_b"), f)?;
        self.attention
            .visit_parameters_mut(&param_name(prefix, "attention"), f)?;
        visit_tensor_mut(prefix, "out_bias", &mut self.out_bias, f)
    }
}

/// The column-attention step of an MSA stack.
///
/// Operates on the column-sharded MSA `[B, S, R / w, C]` with the matching
/// mask `[B, S, R / w]`, attending along the sequence axis. Implementations
/// are purely local.
pub trait ColumnAttention<T: TensorElem>: Module<T> + Sized {
    fn init<R: Rng + ?Sized>(config: &MsaStackConfig, rng: &mut R) -> Result<Self>;

    fn forward(&self, m: &Tensor<T, 4, Cpu>, mask: &Tensor<T, 3, Cpu>) -> Result<Tensor<T, 4, Cpu>>;
}

/// Swaps the sequence and residue axes so attention runs along sequences.
fn to_columns<T: TensorElem>(
    m: &Tensor<T, 4, Cpu>,
    mask: &Tensor<T, 3, Cpu>,
) -> Result<(Tensor<T, 4, Cpu>, Tensor<T, 3, Cpu>)> {
    Ok((m.transpose_axes(1, 2)?, mask.transpose_axes(1, 2)?))
}

/// Gated self-attention along the MSA columns.
#[derive(Debug, Clone)]
pub struct MsaColumnAttention<T: TensorElem> {
    pub layernorm_m: LayerNorm<T>,
    pub attention: SelfAttention<T>,
}

impl<T: TensorElem + Float> ColumnAttention<T> for MsaColumnAttention<T> {
    fn init<R: Rng + ?Sized>(config: &MsaStackConfig, rng: &mut R) -> Result<Self> {
        Ok(Self {
            layernorm_m: LayerNorm::init(config.d_node, config.layer_norm_eps)?,
            attention: SelfAttention::init(
                config.d_node,
                config.col_c,
                config.col_heads,
                config.d_node,
                true,
                config.inf,
                rng,
            )?,
        })
    }

    fn forward(&self, m: &Tensor<T, 4, Cpu>, mask: &Tensor<T, 3, Cpu>) -> Result<Tensor<T, 4, Cpu>> {
        let (columns, column_mask) = to_columns(m, mask)?;
        let update = self
            .attention
            .forward(&self.layernorm_m.forward(&columns)?, &column_mask)?;
        m + &update.transpose_axes(1, 2)?
    }
}

impl<T: TensorElem> Module<T> for MsaColumnAttention<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.layernorm_m
            .visit_parameters(&param_name(prefix, "layernorm_m"), f);
        self.attention
            .visit_parameters(&param_name(prefix, "attention"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.layernorm_m
            .visit_parameters_mut(&param_name(prefix, "layernorm_m"), f)?;
        self.attention
            .visit_parameters_mut(&param_name(prefix, "attention"), f)
    }
}

/// Global attention along the MSA columns, for the extra MSA.
#[derive(Debug, Clone)]
pub struct MsaColumnGlobalAttention<T: TensorElem> {
    pub layernorm_m: LayerNorm<T>,
    pub global_attention: GlobalAttention<T>,
}

impl<T: TensorElem + Float> ColumnAttention<T> for MsaColumnGlobalAttention<T> {
    fn init<R: Rng + ?Sized>(config: &MsaStackConfig, rng: &mut R) -> Result<Self> {
        Ok(Self {
            layernorm_m: LayerNorm::init(config.d_node, config.layer_norm_eps)?,
            global_attention: GlobalAttention::init(
                config.d_node,
                config.col_c,
                config.col_heads,
                config.d_node,
                config.inf,
                rng,
            )?,
        })
    }

    fn forward(&self, m: &Tensor<T, 4, Cpu>, mask: &Tensor<T, 3, Cpu>) -> Result<Tensor<T, 4, Cpu>> {
        let (columns, column_mask) = to_columns(m, mask)?;
        let update = self
            .global_attention
            .forward(&self.layernorm_m.forward(&columns)?, &column_mask)?;
        m + &update.transpose_axes(1, 2)?
    }
}

impl<T: TensorElem> Module<T> for MsaColumnGlobalAttention<T> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.layernorm_m
            .visit_parameters(&param_name(prefix, "layernorm_m"), f);
        self.global_attention
            .visit_parameters(&param_name(prefix, "global_attention"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.layernorm_m
            .visit_parameters_mut(&param_name(prefix, "layernorm_m"), f)?;
        self.global_attention
            .visit_parameters_mut(&param_name(prefix, "global_attention"), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::launch;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn config() -> MsaStackConfig {
        let mut config = MsaStackConfig::msa(4, 3);
        config.row_c = 2;
        config.row_heads = 2;
        config.col_c = 2;
        config.col_heads = 2;
        config
    }

    fn random<const RANK: usize>(shape: [usize; RANK], seed: u64) -> Tensor<f32, RANK> {
        let mut rng = StdRng::seed_from_u64(seed);
        Init::Std(1.0).tensor(shape, 1, &mut rng).unwrap()
    }

    #[test]
    fn test_row_attention_zero_output_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut row = MsaRowAttentionWithPairBias::<f32>::init(&config(), &mut rng).unwrap();
        row.attention.o_linear.weight = Tensor::zeros([4, 4]);

        let m = random([1, 2, 4, 4], 1);
        let z = random([1, 4, 4, 3], 2);
        let mask = Tensor::<f32, 3>::ones([1, 2, 4]);
        let out = launch(1, |backend| {
            row.forward(backend, &m, &z, &mask, DropoutMode::Inference)
        })
        .unwrap();
        assert_eq!(out[0].data(), m.data());
    }

    #[test]
    fn test_row_attention_dropout_is_seeded() {
        let mut rng = StdRng::seed_from_u64(0);
        let row = MsaRowAttentionWithPairBias::<f32>::init(&config(), &mut rng).unwrap();
        let m = random([1, 2, 4, 4], 1);
        let z = random([1, 4, 4, 3], 2);
        let mask = Tensor::<f32, 3>::ones([1, 2, 4]);
        let mode = DropoutMode::Training { seed: 11 };

        let outs = launch(1, |backend| {
            let a = row.forward(backend, &m, &z, &mask, mode)?;
            let b = row.forward(backend, &m, &z, &mask, mode)?;
            let inference = row.forward(backend, &m, &z, &mask, DropoutMode::Inference)?;
            Ok((a, b, inference))
        })
        .unwrap();
        let (a, b, inference) = &outs[0];
        assert_eq!(a.data(), b.data());
        assert!(a.max_abs_diff(inference).unwrap() > 0.0);
    }

    #[test]
    fn test_column_attention_zero_output_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut col = MsaColumnAttention::<f32>::init(&config(), &mut rng).unwrap();
        col.attention.o_linear.weight = Tensor::zeros([4, 4]);

        let m = random([1, 3, 2, 4], 3);
        let mask = Tensor::<f32, 3>::ones([1, 3, 2]);
        let out = col.forward(&m, &mask).unwrap();
        assert_eq!(out.data(), m.data());
    }

    #[test]
    fn test_column_attention_attends_along_sequences() {
        // Columns are independent: changing column 1 leaves column 0 alone.
        let mut rng = StdRng::seed_from_u64(4);
        let col = MsaColumnAttention::<f32>::init(&config(), &mut rng).unwrap();
        let m = random([1, 3, 2, 4], 5);
        let mask = Tensor::<f32, 3>::ones([1, 3, 2]);
        let base = col.forward(&m, &mask).unwrap();

        let mut changed = m.clone();
        for s in 0..3 {
            changed.data_mut()[(s * 2 + 1) * 4] += 1.0;
        }
        let out = col.forward(&changed, &mask).unwrap();
        for s in 0..3 {
            for ch in 0..4 {
                let i = (s * 2) * 4 + ch;
                assert_eq!(base.data()[i], out.data()[i]);
            }
        }
        assert!(base.max_abs_diff(&out).unwrap() > 0.0);
    }

    #[test]
    fn test_global_column_attention_zero_output_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut col = MsaColumnGlobalAttention::<f32>::init(&config(), &mut rng).unwrap();
        col.global_attention.o_linear.weight = Tensor::zeros([4, 4]);

        let m = random([1, 3, 2, 4], 3);
        let mask = Tensor::<f32, 3>::ones([1, 3, 2]);
        let out = col.forward(&m, &mask).unwrap();
        assert_eq!(out.data(), m.data());
    }

    #[test]
    fn test_parameter_names() {
        let mut rng = StdRng::seed_from_u64(0);
        let row = MsaRowAttentionWithPairBias::<f32>::init(&config(), &mut rng).unwrap();
        let mut names = Vec::new();
        row.visit_parameters("row", &mut |name, _, _| names.push(name.to_string()));
        assert!(names.contains(&"row.linear_b.weight".to_string()));
        assert!(names.contains(&"row.attention.to_qkv.weight".to_string()));
        assert!(names.contains(&"row.out_bias".to_string()));
        assert!(!names.contains(&"row.attention.o_linear.bias".to_string()));
    }
}
