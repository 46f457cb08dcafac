//! The MSA track of the Evoformer: row attention with pair bias, column
//! attention, and the stacks that chain them across a worker group.

pub mod attention;
pub mod config;
pub mod stack;

pub use attention::{
    ColumnAttention, MsaColumnAttention, MsaColumnGlobalAttention, MsaRowAttentionWithPairBias,
};
pub use config::MsaStackConfig;
pub use stack::{ExtraMsaStack, MsaStack};
