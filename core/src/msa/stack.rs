use super::attention::{
    ColumnAttention, MsaColumnAttention, MsaColumnGlobalAttention, MsaRowAttentionWithPairBias,
};
use super::config::MsaStackConfig;
use crate::distributed::{COL_DIM, CollectiveBackend, ROW_DIM, row_to_col, scatter};
use crate::nn::module::{Module, ParamVisitor, ParamVisitorMut, param_name};
use crate::nn::{DropoutMode, Transition};
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::Rng;
use tracing::{debug, debug_span};

/// One MSA block of the Evoformer.
///
/// The forward pass is the same on every rank:
///
/// 1. row attention with pair bias on the row-sharded MSA,
/// 2. `row_to_col` into the column-sharded layout,
/// 3. column attention (`C`),
/// 4. the transition.
///
/// The MSA enters row-sharded (`[B, S / w, R, C]`) and leaves
/// column-sharded (`[B, S, R / w, C]`). Rank only selects which shard a worker
/// holds; no stage is skipped on any rank, so every rank issues the same
/// collectives in the same order.
#[derive(Debug, Clone)]
pub struct MsaStack<T: TensorElem, C = MsaColumnAttention<T>> {
    pub row_attention: MsaRowAttentionWithPairBias<T>,
    pub column_attention: C,
    pub transition: Transition<T>,
}

/// The extra-MSA block: column attention is global attention.
pub type ExtraMsaStack<T> = MsaStack<T, MsaColumnGlobalAttention<T>>;

impl<T, C> MsaStack<T, C>
where
    T: TensorElem + Float,
    C: ColumnAttention<T>,
{
    /// Builds a randomly initialised block.
    ///
    /// Parameters are drawn in a fixed order, so ranks seeding `rng`
    /// identically end up with identical weights.
    pub fn init<R: Rng + ?Sized>(config: &MsaStackConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            row_attention: MsaRowAttentionWithPairBias::init(config, rng)?,
            column_attention: C::init(config, rng)?,
            transition: Transition::init(
                config.d_node,
                config.transition_factor,
                config.layer_norm_eps,
                rng,
            )?,
        })
    }

    /// Runs the block on this rank's shards.
    ///
    /// * `node`: row-sharded MSA `[B, S / w, R, C]`
    /// * `pair`: pair representation sharded on axis 1, `[B, R / w, R, D_pair]`
    /// * `node_mask`: the full MSA mask `[B, S, R]`, identical on every rank
    ///
    /// Returns the column-sharded MSA `[B, S, R / w, C]`.
    ///
    /// # Errors
    ///
    /// `TensorError::ShapeMismatch` if the shards do not fit together,
    /// `TensorError::IndivisibleShard` if `S` or `R` does not split across the
    /// group, and `TensorError::Communication` if a peer fails mid-pass.
    pub fn forward<B: CollectiveBackend>(
        &self,
        backend: &B,
        node: &Tensor<T, 4, Cpu>,
        pair: &Tensor<T, 4, Cpu>,
        node_mask: &Tensor<T, 3, Cpu>,
        mode: DropoutMode,
    ) -> Result<Tensor<T, 4, Cpu>> {
        let rank = backend.rank();
        let world_size = backend.world_size();
        check_shards(node, pair, node_mask, world_size)?;
        debug!(rank, world_size, shape = ?node.shape(), "msa stack forward");

        let node = {
            let _span = debug_span!("row_attention", rank).entered();
            let mask_row = scatter(backend, node_mask, ROW_DIM)?;
            self.row_attention
                .forward(backend, node, pair, &mask_row, mode)?
        };

        let node = {
            let _span = debug_span!("row_to_col", rank).entered();
            row_to_col(backend, &node)?
        };

        let node = {
            let _span = debug_span!("column_attention", rank).entered();
            // Re-cut from the full mask; equal to row_to_col of the row shard.
            let mask_col = scatter(backend, node_mask, COL_DIM)?;
            self.column_attention.forward(&node, &mask_col)?
        };

        let _span = debug_span!("transition", rank).entered();
        self.transition.forward(&node)
    }
}

/// Checks that the row-sharded MSA, the pair shard and the full mask
/// describe the same problem.
fn check_shards<T: TensorElem>(
    node: &Tensor<T, 4, Cpu>,
    pair: &Tensor<T, 4, Cpu>,
    node_mask: &Tensor<T, 3, Cpu>,
    world_size: usize,
) -> Result<()> {
    let [b, s_local, r, _] = *node.shape();
    let expected_mask = [b, s_local * world_size, r];
    if node_mask.shape() != &expected_mask {
        return Err(TensorError::ShapeMismatch {
            expected: expected_mask.to_vec(),
            got: node_mask.shape().to_vec(),
        });
    }
    let [pb, pr_local, pr, _] = *pair.shape();
    if pb != b || pr != r || pr_local * world_size != r {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, r / world_size.max(1), r],
            got: pair.shape()[..3].to_vec(),
        });
    }
    Ok(())
}

impl<T: TensorElem, C: Module<T>> Module<T> for MsaStack<T, C> {
    fn visit_parameters(&self, prefix: &str, f: &mut ParamVisitor<'_, T>) {
        self.row_attention
            .visit_parameters(&param_name(prefix, "row_attention"), f);
        self.column_attention
            .visit_parameters(&param_name(prefix, "column_attention"), f);
        self.transition
            .visit_parameters(&param_name(prefix, "transition"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut ParamVisitorMut<'_, T>) -> Result<()> {
        self.row_attention
            .visit_parameters_mut(&param_name(prefix, "row_attention"), f)?;
        self.column_attention
            .visit_parameters_mut(&param_name(prefix, "column_attention"), f)?;
        self.transition
            .visit_parameters_mut(&param_name(prefix, "transition"), f)
    }
}
