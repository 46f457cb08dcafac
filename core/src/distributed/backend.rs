use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use tracing::trace;

/// Abstraction for a distributed communication backend.
///
/// A backend only has to provide tagged point-to-point messaging: a
/// non-blocking `send` and a blocking `recv`, both keyed by the collective's
/// op id. The collectives (`all_gather`, `all_to_all`) are provided methods
/// built on those two, so every backend exchanges data in the same pattern.
///
/// # Ordering
///
/// Op ids come from `next_op`, a per-rank counter. Ranks agree on the id of a
/// collective only if every rank issues the same collectives in the same
/// order. A rank that skips a collective leaves its peers blocked in `recv`
/// forever; there is no timeout.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current worker.
    fn rank(&self) -> usize;

    /// Returns the total number of workers.
    fn world_size(&self) -> usize;

    /// Allocates the id of the next collective issued by this rank.
    fn next_op(&self) -> u64;

    /// Queues `tensor` for rank `dst` under collective `op`. Never blocks.
    fn send<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        dst: usize,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<()>;

    /// Blocks until the message sent by `src` under collective `op` arrives.
    ///
    /// Messages for other ops that arrive first are kept until asked for.
    fn recv<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        src: usize,
    ) -> Result<Tensor<T, RANK, Cpu>>;

    /// Sends `tensor` to every other rank under `op`.
    fn send_to_peers<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<()> {
        let rank = self.rank();
        for dst in (0..self.world_size()).filter(|&dst| dst != rank) {
            self.send(op, dst, tensor)?;
        }
        trace!(rank, op, shape = ?tensor.shape(), "sent shard to peers");
        Ok(())
    }

    /// Receives one shard per peer under `op` and concatenates all shards,
    /// `local` included, along `dim` in rank order.
    fn recv_from_peers<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        local: Tensor<T, RANK, Cpu>,
        dim: usize,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let rank = self.rank();
        let mut local = Some(local);
        let mut parts = Vec::with_capacity(self.world_size());
        for src in 0..self.world_size() {
            if src == rank {
                let own = local.take().ok_or_else(|| {
                    TensorError::Communication(format!("rank {rank} listed twice"))
                })?;
                parts.push(own);
            } else {
                parts.push(self.recv(op, src)?);
            }
        }
        trace!(rank, op, dim, "received shards from peers");
        Tensor::cat(&parts, dim)
    }

    /// Concatenates every rank's `tensor` along `dim`, in rank order.
    ///
    /// Every rank receives the full result.
    fn all_gather<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK, Cpu>,
        dim: usize,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: tensor.shape().to_vec(),
            });
        }
        let op = self.next_op();
        self.send_to_peers(op, tensor)?;
        self.recv_from_peers(op, tensor.clone(), dim)
    }

    /// Sends `chunks[j]` to rank `j` and returns the chunk received from each
    /// rank, indexed by source rank.
    fn all_to_all<T: TensorElem, const RANK: usize>(
        &self,
        chunks: Vec<Tensor<T, RANK, Cpu>>,
    ) -> Result<Vec<Tensor<T, RANK, Cpu>>> {
        let world_size = self.world_size();
        if chunks.len() != world_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![world_size],
                got: vec![chunks.len()],
            });
        }
        let rank = self.rank();
        let op = self.next_op();
        trace!(rank, op, "all_to_all");

        let mut own = None;
        for (dst, chunk) in chunks.into_iter().enumerate() {
            if dst == rank {
                own = Some(chunk);
            } else {
                self.send(op, dst, &chunk)?;
            }
        }

        let mut received = Vec::with_capacity(world_size);
        for src in 0..world_size {
            if src == rank {
                let chunk = own.take().ok_or_else(|| {
                    TensorError::Communication(format!("rank {rank} lost its own chunk"))
                })?;
                received.push(chunk);
            } else {
                received.push(self.recv(op, src)?);
            }
        }
        Ok(received)
    }
}
