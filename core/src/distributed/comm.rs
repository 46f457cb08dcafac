//! Sharding primitives for MSA and pair tensors.
//!
//! A 4-D MSA activation `[B, S, R, C]` is either *row-sharded* (each rank
//! holds `S / world_size` sequences) or *column-sharded* (each rank holds
//! `R / world_size` residue positions). Axis 1 is the row axis and axis 2 the
//! column axis; the same functions work on the 3-D masks `[B, S, R]`.
//!
//! Every function here must be called by all ranks in the same order; see
//! [`CollectiveBackend`].

use super::backend::CollectiveBackend;
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use std::ops::Range;
use tracing::trace;

/// Axis of the MSA sequences.
pub const ROW_DIM: usize = 1;
/// Axis of the residue positions.
pub const COL_DIM: usize = 2;

/// Number of entries each rank owns when an axis of length `size` (axis
/// `dim`) is split across `world_size` ranks.
pub fn shard_size(size: usize, world_size: usize, dim: usize) -> Result<usize> {
    if world_size == 0 || size % world_size != 0 {
        return Err(TensorError::IndivisibleShard {
            dim,
            size,
            world_size,
        });
    }
    Ok(size / world_size)
}

/// The contiguous index range of axis `dim` owned by `rank`.
pub fn shard_range(size: usize, rank: usize, world_size: usize, dim: usize) -> Result<Range<usize>> {
    if rank >= world_size {
        return Err(TensorError::InvalidRank { rank, world_size });
    }
    let len = shard_size(size, world_size, dim)?;
    Ok(rank * len..(rank + 1) * len)
}

/// Returns this rank's contiguous chunk of `tensor` along `dim`.
///
/// `tensor` must be the full (replicated) tensor. No data is exchanged.
pub fn scatter<B, T, const RANK: usize>(
    backend: &B,
    tensor: &Tensor<T, RANK, Cpu>,
    dim: usize,
) -> Result<Tensor<T, RANK, Cpu>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if dim >= RANK {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![dim],
            shape: tensor.shape().to_vec(),
        });
    }
    let range = shard_range(
        tensor.shape()[dim],
        backend.rank(),
        backend.world_size(),
        dim,
    )?;
    tensor.narrow(dim, range.start, range.len())
}

/// Reassembles the full tensor from every rank's shard along `dim`.
///
/// Blocks until all ranks have contributed.
pub fn gather<B, T, const RANK: usize>(
    backend: &B,
    tensor: &Tensor<T, RANK, Cpu>,
    dim: usize,
) -> Result<Tensor<T, RANK, Cpu>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if dim >= RANK {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![dim],
            shape: tensor.shape().to_vec(),
        });
    }
    if backend.world_size() == 1 {
        return Ok(tensor.clone());
    }
    backend.all_gather(tensor, dim)
}

/// Exchanges `split_dim` for `cat_dim` as the sharded axis.
///
/// The local tensor is cut into `world_size` pieces along `split_dim`; piece
/// `j` goes to rank `j`, and the pieces received are joined along `cat_dim`
/// in source-rank order, which is the global order of that axis.
fn reshard<B, T, const RANK: usize>(
    backend: &B,
    tensor: &Tensor<T, RANK, Cpu>,
    split_dim: usize,
    cat_dim: usize,
) -> Result<Tensor<T, RANK, Cpu>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    if RANK < 3 {
        return Err(TensorError::Unsupported(format!(
            "resharding needs row and column axes, got rank {RANK}"
        )));
    }
    let world_size = backend.world_size();
    shard_size(tensor.shape()[split_dim], world_size, split_dim)?;
    if world_size == 1 {
        return Ok(tensor.clone());
    }

    trace!(
        rank = backend.rank(),
        split_dim,
        cat_dim,
        shape = ?tensor.shape(),
        "reshard"
    );
    let pieces = tensor.chunk(world_size, split_dim)?;
    let received = backend.all_to_all(pieces)?;
    Tensor::cat(&received, cat_dim)
}

/// Converts a row-sharded tensor (`[B, S / w, R, ...]`) into the equivalent
/// column-sharded tensor (`[B, S, R / w, ...]`).
///
/// # Errors
///
/// `TensorError::IndivisibleShard` if the column axis does not split evenly.
pub fn row_to_col<B, T, const RANK: usize>(
    backend: &B,
    tensor: &Tensor<T, RANK, Cpu>,
) -> Result<Tensor<T, RANK, Cpu>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    reshard(backend, tensor, COL_DIM, ROW_DIM)
}

/// Inverse of [`row_to_col`].
pub fn col_to_row<B, T, const RANK: usize>(
    backend: &B,
    tensor: &Tensor<T, RANK, Cpu>,
) -> Result<Tensor<T, RANK, Cpu>>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    reshard(backend, tensor, ROW_DIM, COL_DIM)
}
