//! Non-blocking gather.
//!
//! [`gather_async`] posts this rank's shard to every peer and returns at
//! once. The gathered tensor only exists once [`AsyncGather::wait`] has
//! received the peers' shards, and `wait` consumes the value, so a pending
//! result can be neither read early nor waited on twice.

use super::backend::CollectiveBackend;
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use tracing::{trace, warn};

/// The result of [`gather_async`].
#[must_use = "a gather result must be consumed with `wait`"]
#[derive(Debug)]
pub enum AsyncGather<'a, B, T, const RANK: usize>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    /// Nothing to exchange (single worker); the tensor is final.
    Ready(Tensor<T, RANK, Cpu>),
    /// Shards are in flight.
    Pending(GatherHandle<'a, B, T, RANK>),
}

impl<B, T, const RANK: usize> AsyncGather<'_, B, T, RANK>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    /// `true` if `wait` will not communicate.
    pub fn is_ready(&self) -> bool {
        matches!(self, AsyncGather::Ready(_))
    }

    /// Blocks until every peer's shard has arrived and returns the full tensor.
    pub fn wait(self) -> Result<Tensor<T, RANK, Cpu>> {
        match self {
            AsyncGather::Ready(tensor) => Ok(tensor),
            AsyncGather::Pending(handle) => handle.wait(),
        }
    }
}

/// An in-flight gather: this rank's shard has been sent, the peers' shards
/// have not been received yet.
#[derive(Debug)]
pub struct GatherHandle<'a, B, T, const RANK: usize>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    backend: &'a B,
    op: u64,
    dim: usize,
    local: Option<Tensor<T, RANK, Cpu>>,
}

impl<B, T, const RANK: usize> GatherHandle<'_, B, T, RANK>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    /// The collective id this handle is waiting on.
    pub fn op(&self) -> u64 {
        self.op
    }

    pub fn wait(mut self) -> Result<Tensor<T, RANK, Cpu>> {
        let local = self.local.take().ok_or_else(|| {
            TensorError::Communication(format!("gather {} already completed", self.op))
        })?;
        trace!(rank = self.backend.rank(), op = self.op, "waiting on gather");
        self.backend.recv_from_peers(self.op, local, self.dim)
    }
}

impl<B, T, const RANK: usize> Drop for GatherHandle<'_, B, T, RANK>
where
    B: CollectiveBackend,
    T: TensorElem,
{
    fn drop(&mut self) {
        if self.local.is_some() {
            warn!(
                rank = self.backend.rank(),
                op = self.op,
                "gather handle dropped without wait; peer shards were never received"
            );
        }
    }
}

/// Starts gathering `tensor` along `dim` without waiting for the peers.
///
/// Must be issued by every rank at the same point of the collective order as
/// a synchronous [`gather`](super::comm::gather) would be.
pub fn gather_async<'a, B, T, const RANK: usize>(
    backend: &'a B,
    tensor: &Tensor<T, RANK, Cpu>,
    dim: usize,
) -> Result<AsyncGather<'a, B, T, RANK>>
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
        return Ok(AsyncGather::Ready(tensor.clone()));
    }

    let op = backend.next_op();
    backend.send_to_peers(op, tensor)?;
    Ok(AsyncGather::Pending(GatherHandle {
        backend,
        op,
        dim,
        local: Some(tensor.clone()),
    }))
}
