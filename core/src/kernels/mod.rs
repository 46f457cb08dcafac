//! Fused CPU kernels for the attention layers.
//!
//! The `nn` layers do the projections with plain tensor ops and hand the
//! projected activations to these kernels, which compute the masked softmax,
//! the weighted sum and the gating in one pass per group.

pub mod attention;

pub use attention::{
    GatedAttentionInputs, GlobalAttentionInputs, fused_gated_attention, fused_global_attention,
};
