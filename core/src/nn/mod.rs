//! Neural network building blocks.

pub mod activation;
pub mod attention;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod module;
pub mod norm;
pub mod transition;

pub use activation::Activation;
pub use attention::{GlobalAttention, SelfAttention};
pub use dropout::{Dropout, DropoutMode, bias_dropout_add};
pub use init::Init;
pub use linear::Linear;
pub use module::{Module, ParamVisitor, ParamVisitorMut, param_name};
pub use norm::LayerNorm;
pub use transition::Transition;
