//! # Distributed execution
//!
//! The MSA stack runs SPMD: one worker per shard, all executing the same
//! forward pass on different slices of the MSA and pair tensors, coordinated
//! only through collectives.
//!
//! - [`backend::CollectiveBackend`]: tagged point-to-point messaging plus the
//!   `all_gather` / `all_to_all` collectives built on it.
//! - [`cpu_backend::CpuBackend`]: an in-process backend where each rank is a
//!   thread and ranks talk over `crossbeam` channels.
//! - [`comm`]: `scatter`, `gather`, `row_to_col`, `col_to_row`.
//! - [`comm_async`]: `gather_async`, whose result must be `wait`ed on before
//!   the gathered tensor can be read.
//!
//! ## Deadlock risk
//!
//! Collectives are matched across ranks by the order they are issued in. If
//! one rank skips a collective (or issues them in a different order), its
//! peers block in `recv` forever; nothing here times out. Code that calls
//! collectives must take the same path on every rank, branching only on
//! shapes and configuration, never on the rank itself.

pub mod backend;
pub mod comm;
pub mod comm_async;
pub mod cpu_backend;

pub use backend::CollectiveBackend;
pub use comm::{COL_DIM, ROW_DIM, col_to_row, gather, row_to_col, scatter, shard_range, shard_size};
pub use comm_async::{AsyncGather, GatherHandle, gather_async};
pub use cpu_backend::{CpuBackend, launch};
