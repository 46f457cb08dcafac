use super::backend::CollectiveBackend;
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError, shape_array};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A tensor in flight between two ranks.
///
/// Elements travel as `f64` so that the channel type does not depend on the
/// element type; every `TensorElem` round-trips through `f64` exactly for the
/// `f32`/`f64` tensors the stack uses.
#[derive(Debug)]
struct Packet {
    op: u64,
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// An in-process collective backend.
///
/// Each ordered pair of ranks is connected by its own unbounded `crossbeam`
/// channel, so sends never block and messages between two ranks keep their
/// order. Packets that arrive ahead of the collective waiting for them are
/// stashed per source rank, keyed by op id.
///
/// Build a group with [`CpuBackend::mesh`] and run one thread per rank, or let
/// [`launch`] do both.
#[derive(Debug)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    /// Indexed by destination rank.
    senders: Vec<Sender<Packet>>,
    /// Indexed by source rank.
    receivers: Vec<Receiver<Packet>>,
    /// Early arrivals, indexed by source rank.
    stash: Vec<Mutex<HashMap<u64, Packet>>>,
    next_op: AtomicU64,
}

impl CpuBackend {
    /// Builds a fully connected group of `world_size` ranks.
    ///
    /// The returned backends are in rank order.
    pub fn mesh(world_size: usize) -> Result<Vec<CpuBackend>> {
        if world_size == 0 {
            return Err(TensorError::Config(
                "world size must be at least 1".into(),
            ));
        }

        // channels[src][dst]
        let channels: Vec<Vec<(Sender<Packet>, Receiver<Packet>)>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| unbounded()).collect())
            .collect();

        let backends = (0..world_size)
            .map(|rank| CpuBackend {
                rank,
                world_size,
                senders: (0..world_size)
                    .map(|dst| channels[rank][dst].0.clone())
                    .collect(),
                receivers: (0..world_size)
                    .map(|src| channels[src][rank].1.clone())
                    .collect(),
                stash: (0..world_size).map(|_| Mutex::new(HashMap::new())).collect(),
                next_op: AtomicU64::new(0),
            })
            .collect();

        debug!(world_size, "built CPU collective mesh");
        Ok(backends)
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(TensorError::InvalidRank {
                rank: peer,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn take_stashed(&self, op: u64, src: usize) -> Result<Option<Packet>> {
        let mut stash = self.stash[src]
            .lock()
            .map_err(|_| TensorError::Communication("message stash poisoned".into()))?;
        Ok(stash.remove(&op))
    }

    fn stash_packet(&self, src: usize, packet: Packet) -> Result<()> {
        let mut stash = self.stash[src]
            .lock()
            .map_err(|_| TensorError::Communication("message stash poisoned".into()))?;
        stash.insert(packet.op, packet);
        Ok(())
    }

    fn unpack<T: TensorElem, const RANK: usize>(
        &self,
        src: usize,
        packet: Packet,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let shape = shape_array(packet.shape)?;
        let data = packet
            .data
            .into_iter()
            .map(|x| {
                T::from_f64(x).ok_or_else(|| {
                    TensorError::Communication(format!(
                        "value {x} from rank {src} does not fit the element type"
                    ))
                })
            })
            .collect::<Result<Vec<T>>>()?;
        Tensor::new(data, shape)
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn next_op(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    fn send<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        dst: usize,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<()> {
        self.check_peer(dst)?;
        let data = tensor
            .data()
            .iter()
            .map(|x| {
                x.to_f64().ok_or_else(|| {
                    TensorError::Communication(format!("{x:?} has no f64 representation"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        let packet = Packet {
            op,
            shape: tensor.shape().to_vec(),
            data,
        };
        trace!(rank = self.rank, dst, op, "send");
        self.senders[dst].send(packet).map_err(|_| {
            TensorError::Communication(format!("rank {dst} is no longer receiving"))
        })
    }

    fn recv<T: TensorElem, const RANK: usize>(
        &self,
        op: u64,
        src: usize,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        self.check_peer(src)?;
        if let Some(packet) = self.take_stashed(op, src)? {
            trace!(rank = self.rank, src, op, "recv from stash");
            return self.unpack(src, packet);
        }

        loop {
            let packet = self.receivers[src].recv().map_err(|_| {
                TensorError::Communication(format!("rank {src} hung up before op {op}"))
            })?;
            if packet.op == op {
                trace!(rank = self.rank, src, op, "recv");
                return self.unpack(src, packet);
            }
            trace!(rank = self.rank, src, op = packet.op, waiting_for = op, "stashing early packet");
            self.stash_packet(src, packet)?;
        }
    }
}

/// Runs `f` once per rank of a fresh `world_size` mesh, each on its own
/// scoped thread, and returns the per-rank results in rank order.
///
/// The first error (in rank order) is returned. A panicking worker is
/// reported as `TensorError::Communication`.
pub fn launch<F, R>(world_size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(&CpuBackend) -> Result<R> + Sync,
    R: Send,
{
    let backends = CpuBackend::mesh(world_size)?;
    let f = &f;

    let joined: Vec<std::thread::Result<Result<R>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = backends
            .into_iter()
            .map(|backend| scope.spawn(move || f(&backend)))
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    joined
        .into_iter()
        .enumerate()
        .map(|(rank, outcome)| {
            outcome.map_err(|_| TensorError::Communication(format!("worker {rank} panicked")))?
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_ranks() {
        let group = CpuBackend::mesh(3).unwrap();
        let ranks: Vec<usize> = group.iter().map(|b| b.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(group.iter().all(|b| b.world_size() == 3));
        assert!(CpuBackend::mesh(0).is_err());
    }

    #[test]
    fn test_send_recv_point_to_point() {
        let group = CpuBackend::mesh(2).unwrap();
        let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        group[0].send(7, 1, &t).unwrap();
        let got: Tensor<f32, 2> = group[1].recv(7, 0).unwrap();
        assert_eq!(got.shape(), &[2, 2]);
        assert_eq!(got.data(), t.data());
    }

    #[test]
    fn test_out_of_order_ops_are_stashed() {
        let group = CpuBackend::mesh(2).unwrap();
        let a = Tensor::<f32, 1>::full([2], 1.0);
        let b = Tensor::<f32, 1>::full([3], 2.0);
        group[0].send(0, 1, &a).unwrap();
        group[0].send(1, 1, &b).unwrap();

        // Ask for the later op first.
        let got_b: Tensor<f32, 1> = group[1].recv(1, 0).unwrap();
        let got_a: Tensor<f32, 1> = group[1].recv(0, 0).unwrap();
        assert_eq!(got_b.data(), &[2.0; 3]);
        assert_eq!(got_a.data(), &[1.0; 2]);
    }

    #[test]
    fn test_invalid_peer() {
        let group = CpuBackend::mesh(2).unwrap();
        let t = Tensor::<f32, 1>::zeros([1]);
        assert!(matches!(
            group[0].send(0, 5, &t),
            Err(TensorError::InvalidRank { rank: 5, world_size: 2 })
        ));
    }

    #[test]
    fn test_recv_rank_mismatch() {
        let group = CpuBackend::mesh(2).unwrap();
        let t = Tensor::<f32, 2>::zeros([2, 2]);
        group[0].send(0, 1, &t).unwrap();
        let got = group[1].recv::<f32, 3>(0, 0);
        assert!(matches!(got, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_hung_up_peer() {
        let mut group = CpuBackend::mesh(2).unwrap();
        let survivor = group.remove(1);
        drop(group);
        let got = survivor.recv::<f32, 1>(0, 0);
        assert!(matches!(got, Err(TensorError::Communication(_))));
    }

    #[test]
    fn test_launch_all_gather() {
        let results = launch(3, |backend| {
            let local = Tensor::<f32, 2>::full([1, 2], backend.rank() as f32);
            backend.all_gather(&local, 0)
        })
        .unwrap();
        for gathered in results {
            assert_eq!(gathered.shape(), &[3, 2]);
            assert_eq!(gathered.data(), &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_launch_all_to_all() {
        let results = launch(2, |backend| {
            let rank = backend.rank() as f32;
            let chunks = (0..2)
                .map(|dst| Tensor::<f32, 1>::full([1], rank * 10.0 + dst as f32))
                .collect();
            backend.all_to_all(chunks)
        })
        .unwrap();
        // Rank r receives [0r, 1r] indexed by source.
        assert_eq!(results[0][0].data(), &[0.0]);
        assert_eq!(results[0][1].data(), &[10.0]);
        assert_eq!(results[1][0].data(), &[1.0]);
        assert_eq!(results[1][1].data(), &[11.0]);
    }

    #[test]
    fn test_launch_reports_errors_and_panics() {
        let err = launch(2, |backend| {
            if backend.rank() == 1 {
                return Err::<(), _>(TensorError::Config("boom".into()));
            }
            Ok(())
        });
        assert!(matches!(err, Err(TensorError::Config(_))));

        let err = launch(2, |backend| {
            if backend.rank() == 0 {
                panic!("worker failure");
            }
            Ok(())
        });
        assert!(matches!(err, Err(TensorError::Communication(_))));
    }
}
