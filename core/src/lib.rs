//! # evoformer-rs
//!
//! `evoformer-rs` implements the MSA track of an Evoformer block on CPU
//! tensors, split across a group of workers that run the same program on
//! different shards of the data.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional tensors with a const-generic rank.
//! - [`distributed`]: the collective backend and the sharding primitives
//!   (`scatter`, `gather`, `gather_async`, `row_to_col`).
//! - [`kernels`]: fused attention kernels.
//! - [`nn`]: layers (`Linear`, `LayerNorm`, attention, dropout, transition).
//! - [`msa`]: row and column attention and the `MsaStack` / `ExtraMsaStack`.
//! - [`checkpoint`]: safetensors parameter files.
//!
//! ## Example
//!
//! ```rust
//! use evoformer_rs::distributed::{COL_DIM, ROW_DIM, gather, launch, scatter};
//! use evoformer_rs::msa::{MsaStack, MsaStackConfig};
//! use evoformer_rs::nn::DropoutMode;
//! use evoformer_rs::tensor::Tensor;
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//!
//! let mut config = MsaStackConfig::msa(8, 4);
//! config.row_c = 4;
//! config.col_c = 4;
//! let stack: MsaStack<f32> = MsaStack::init(&config, &mut StdRng::seed_from_u64(0)).unwrap();
//!
//! let node = Tensor::<f32, 4>::ones([1, 4, 6, 8]);
//! let pair = Tensor::<f32, 4>::ones([1, 6, 6, 4]);
//! let mask = Tensor::<f32, 3>::ones([1, 4, 6]);
//!
//! let outputs = launch(2, |backend| {
//!     let node = scatter(backend, &node, ROW_DIM)?;
//!     let pair = scatter(backend, &pair, ROW_DIM)?;
//!     let out = stack.forward(backend, &node, &pair, &mask, DropoutMode::Inference)?;
//!     gather(backend, &out, COL_DIM)
//! })
//! .unwrap();
//! assert_eq!(outputs[0].shape(), &[1, 4, 6, 8]);
//! ```

pub mod checkpoint;
pub mod distributed;
pub mod kernels;
pub mod msa;
pub mod nn;
pub mod tensor;

pub use tensor::{Cpu, Device, Result, Storage, Tensor, TensorElem, TensorError};
