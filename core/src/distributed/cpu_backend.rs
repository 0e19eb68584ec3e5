use super::backend::CollectiveBackend;
use super::ring::RingComm;
use super::topology::RingTopology;
use super::transport::RingTransport;
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem, TensorError};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Channel name used by the all-reduce.
pub const ALL_REDUCE_CHANNEL: &str = "collective.all_reduce";

/// Collective backend running **Ring All-Reduce** over a [`RingTransport`].
///
/// The buffer is cut into `world_size` equal chunks (zero padded). During scatter-reduce each rank
/// forwards one chunk per step and adds the chunk it receives; after `world_size - 1` steps every
/// rank owns one fully reduced chunk. All-gather then circulates the reduced chunks the same way.
/// Sums are carried in `f64`.
pub struct CpuBackend {
    topology: RingTopology,
    comm: Mutex<RingComm>,
}

impl CpuBackend {
    pub fn new(transport: Arc<dyn RingTransport>) -> Result<Self> {
        let comm = RingComm::new(transport, ALL_REDUCE_CHANNEL)?;
        Ok(Self {
            topology: comm.topology(),
            comm: Mutex::new(comm),
        })
    }

    fn chunk_index(&self, offset: isize) -> usize {
        let w = self.topology.world_size() as isize;
        (self.topology.rank() as isize + offset).rem_euclid(w) as usize
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("topology", &self.topology)
            .finish()
    }
}

/// One send/receive step of the all-reduce.
fn rotate(comm: &mut RingComm, chunk: &[f64]) -> Result<Vec<f64>> {
    let outgoing = Tensor::<f64, 1>::new(chunk.to_vec(), [chunk.len()])?;
    let ticket = comm.exchange(&outgoing)?;
    comm.commit()?;
    Ok(comm.wait()?.take(ticket)?.into_data())
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.topology.rank()
    }

    fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    fn all_reduce_sum<T: TensorElem, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let world = self.topology.world_size();
        if world == 1 {
            return Ok(tensor.clone());
        }

        let total = tensor.size();
        let chunk = total.div_ceil(world).max(1);
        let mut data: Vec<f64> = tensor.cast::<f64>()?.into_data();
        data.resize(chunk * world, 0.0);

        let mut comm = self.comm.lock().map_err(|_| Error::Comm {
            channel: ALL_REDUCE_CHANNEL.into(),
            reason: "backend poisoned by a panicked thread".into(),
        })?;
        debug!(rank = self.rank(), world, elements = total, "all-reduce");

        // --- Phase 1: Scatter-Reduce ---
        for step in 0..world - 1 {
            let send = self.chunk_index(-(step as isize));
            let recv = self.chunk_index(-(step as isize) - 1);
            let incoming = rotate(&mut comm, &data[send * chunk..(send + 1) * chunk])?;
            for (d, x) in data[recv * chunk..(recv + 1) * chunk].iter_mut().zip(incoming) {
                *d += x;
            }
        }

        // --- Phase 2: All-Gather ---
        for step in 0..world - 1 {
            let send = self.chunk_index(1 - step as isize);
            let recv = self.chunk_index(-(step as isize));
            let incoming = rotate(&mut comm, &data[send * chunk..(send + 1) * chunk])?;
            data[recv * chunk..(recv + 1) * chunk].copy_from_slice(&incoming);
        }

        data.truncate(total);
        if !data.iter().all(|x| x.is_finite()) {
            return Err(Error::NonFinite { op: "all-reduce" });
        }
        let reduced = data
            .into_iter()
            .map(T::from_f64)
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| TensorError::Unsupported("reduced value out of range".into()))?;
        Ok(Tensor::new(reduced, *tensor.shape())?)
    }
}
