//! Batched, named exchanges around the ring.
//!
//! A [`RingComm`] is one logical channel. Exchanges go through three phases:
//!
//! 1. [`RingComm::exchange`] queues a tensor for the next rank and returns a [`Ticket`] for the
//!    tensor that will arrive from the previous rank (same shape).
//! 2. [`RingComm::commit`] launches everything queued so far as one batch.
//! 3. [`RingComm::wait`] blocks until every committed exchange has arrived and returns a
//!    [`Completed`] set; tickets are redeemed there.
//!
//! Compute placed between `commit` and `wait` overlaps with the transfer.
//!
//! ```rust
//! use std::sync::Arc;
//! use ringtrain::distributed::{LocalRing, RingComm};
//! use ringtrain::tensor::Tensor;
//!
//! let endpoint = LocalRing::new(1).unwrap().remove(0);
//! let mut comm = RingComm::new(Arc::new(endpoint), "demo").unwrap();
//!
//! let block = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let ticket = comm.exchange(&block).unwrap();
//! comm.commit().unwrap();
//! let mut done = comm.wait().unwrap();
//! assert_eq!(done.take(ticket).unwrap().data(), &[1.0, 2.0]);
//! ```

use super::topology::RingTopology;
use super::transport::{Frame, RingTransport};
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem, TensorError};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{trace, warn};

/// Claim on the tensor received for one [`RingComm::exchange`].
#[must_use = "a ticket is the only way to read the received tensor"]
#[derive(Debug)]
pub struct Ticket<T, const RANK: usize> {
    seq: u64,
    shape: [usize; RANK],
    _elem: PhantomData<T>,
}

/// Expected arrival of a committed exchange.
#[derive(Debug)]
struct Pending {
    seq: u64,
    shape: Vec<usize>,
}

/// One named channel over a shared transport.
pub struct RingComm {
    transport: Arc<dyn RingTransport>,
    topology: RingTopology,
    channel: String,
    next_seq: u64,
    issued: Vec<Frame>,
    in_flight: Vec<Pending>,
}

impl std::fmt::Debug for RingComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingComm")
            .field("channel", &self.channel)
            .field("topology", &self.topology)
            .field("issued", &self.issued.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl RingComm {
    pub fn new(transport: Arc<dyn RingTransport>, channel: impl Into<String>) -> Result<Self> {
        let topology = transport.topology()?;
        Ok(Self {
            transport,
            topology,
            channel: channel.into(),
            next_seq: 0,
            issued: Vec::new(),
            in_flight: Vec::new(),
        })
    }

    pub const fn topology(&self) -> RingTopology {
        self.topology
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Exchanges queued or launched but not yet waited on.
    pub fn outstanding(&self) -> usize {
        self.issued.len() + self.in_flight.len()
    }

    /// Queues `tensor` for the next rank. Nothing moves until [`commit`](Self::commit).
    pub fn exchange<T: TensorElem, const RANK: usize>(
        &mut self,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<Ticket<T, RANK>> {
        let seq = self.next_seq;
        let frame = Frame::from_tensor(&self.channel, seq, self.topology, tensor)?;
        self.next_seq += 1;
        self.issued.push(frame);
        Ok(Ticket {
            seq,
            shape: *tensor.shape(),
            _elem: PhantomData,
        })
    }

    /// Launches every queued exchange.
    pub fn commit(&mut self) -> Result<()> {
        trace!(channel = %self.channel, count = self.issued.len(), "commit");
        for frame in self.issued.drain(..) {
            self.in_flight.push(Pending {
                seq: frame.seq,
                shape: frame.shape.clone(),
            });
            self.transport.send_next(frame)?;
        }
        Ok(())
    }

    /// Blocks until every launched exchange has arrived.
    ///
    /// Returns an empty set when nothing is in flight. Queued exchanges that were never committed
    /// are an error: the previous rank cannot have answered them.
    pub fn wait(&mut self) -> Result<Completed> {
        if !self.issued.is_empty() {
            return Err(Error::Comm {
                channel: self.channel.clone(),
                reason: format!(
                    "wait with {} exchange(s) issued but not committed",
                    self.issued.len()
                ),
            });
        }

        let mut frames = HashMap::with_capacity(self.in_flight.len());
        for pending in std::mem::take(&mut self.in_flight) {
            let frame = self.transport.recv_prev(&self.channel)?;
            self.check(&frame, &pending)?;
            frames.insert(pending.seq, frame);
        }
        trace!(channel = %self.channel, count = frames.len(), "wait complete");

        Ok(Completed {
            channel: self.channel.clone(),
            frames,
        })
    }

    fn check(&self, frame: &Frame, pending: &Pending) -> Result<()> {
        if frame.world_size != self.topology.world_size() {
            return Err(Error::Topology(format!(
                "channel `{}`: rank {} believes world size is {}, rank {} believes {}",
                self.channel,
                frame.origin,
                frame.world_size,
                self.topology.rank(),
                self.topology.world_size()
            )));
        }
        if frame.origin != self.topology.prev() {
            return Err(Error::Topology(format!(
                "channel `{}`: expected a frame from rank {}, got one from rank {}",
                self.channel,
                self.topology.prev(),
                frame.origin
            )));
        }
        if frame.seq != pending.seq {
            return Err(Error::Topology(format!(
                "channel `{}`: expected exchange #{}, received #{}",
                self.channel, pending.seq, frame.seq
            )));
        }
        if frame.shape != pending.shape {
            return Err(TensorError::ShapeMismatch {
                expected: pending.shape.clone(),
                got: frame.shape.clone(),
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for RingComm {
    fn drop(&mut self) {
        if self.outstanding() > 0 {
            warn!(
                channel = %self.channel,
                rank = self.topology.rank(),
                outstanding = self.outstanding(),
                "ring channel dropped with exchanges in flight"
            );
        }
    }
}

/// Tensors received by one [`RingComm::wait`].
#[derive(Debug)]
pub struct Completed {
    channel: String,
    frames: HashMap<u64, Frame>,
}

impl Completed {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Redeems a ticket for the tensor it stands for.
    pub fn take<T: TensorElem, const RANK: usize>(
        &mut self,
        ticket: Ticket<T, RANK>,
    ) -> Result<Tensor<T, RANK, Cpu>> {
        let frame = self.frames.remove(&ticket.seq).ok_or_else(|| Error::Comm {
            channel: self.channel.clone(),
            reason: format!("exchange #{} is not part of this completion", ticket.seq),
        })?;
        frame.into_tensor(ticket.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::transport::LocalRing;
    use std::thread;

    #[test]
    fn test_rotation_over_three_ranks() {
        let handles: Vec<_> = LocalRing::new(3)
            .unwrap()
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let rank = ep.rank();
                    let mut comm = RingComm::new(Arc::new(ep), "rot").unwrap();
                    let mine = Tensor::<f64, 1>::full([2], rank as f64);
                    let ticket = comm.exchange(&mine).unwrap();
                    comm.commit().unwrap();
                    let got = comm.wait().unwrap().take(ticket).unwrap();
                    (rank, got.data()[0] as usize)
                })
            })
            .collect();

        for h in handles {
            let (rank, from) = h.join().unwrap();
            assert_eq!(from, (rank + 2) % 3);
        }
    }

    #[test]
    fn test_batch_of_two_keeps_order() {
        let ep = LocalRing::new(1).unwrap().remove(0);
        let mut comm = RingComm::new(Arc::new(ep), "kv").unwrap();
        let k = Tensor::<f32, 1>::full([1], 1.0);
        let v = Tensor::<f32, 1>::full([3], 2.0);
        let tk = comm.exchange(&k).unwrap();
        let tv = comm.exchange(&v).unwrap();
        comm.commit().unwrap();

        let mut done = comm.wait().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done.take(tv).unwrap().data(), &[2.0; 3]);
        assert_eq!(done.take(tk).unwrap().data(), &[1.0]);
        assert!(done.is_empty());
    }

    #[test]
    fn test_wait_without_anything_in_flight_is_noop() {
        let ep = LocalRing::new(1).unwrap().remove(0);
        let mut comm = RingComm::new(Arc::new(ep), "idle").unwrap();
        assert!(comm.wait().unwrap().is_empty());
    }

    #[test]
    fn test_wait_before_commit_is_an_error() {
        let ep = LocalRing::new(1).unwrap().remove(0);
        let mut comm = RingComm::new(Arc::new(ep), "early").unwrap();
        let _ticket = comm.exchange(&Tensor::<f32, 1>::zeros([1])).unwrap();
        assert!(matches!(comm.wait(), Err(Error::Comm { .. })));
    }

    #[test]
    fn test_shape_disagreement_is_fatal() {
        let mut eps = LocalRing::new(2).unwrap();
        let b = Arc::new(eps.remove(1));
        let a = Arc::new(eps.remove(0));

        let mut ca = RingComm::new(a, "shape").unwrap();
        let mut cb = RingComm::new(b, "shape").unwrap();

        let _ta = ca.exchange(&Tensor::<f32, 1>::zeros([2])).unwrap();
        let _tb = cb.exchange(&Tensor::<f32, 1>::zeros([3])).unwrap();
        ca.commit().unwrap();
        cb.commit().unwrap();

        assert!(matches!(
            ca.wait(),
            Err(Error::Tensor(TensorError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn test_world_size_disagreement_is_topology_error() {
        let ep = LocalRing::new(1).unwrap().remove(0);
        ep.send_next(Frame {
            channel: "ws".into(),
            seq: 0,
            origin: 0,
            world_size: 4,
            shape: vec![1],
            data: vec![0.0],
        })
        .unwrap();

        let mut comm = RingComm::new(Arc::new(ep), "ws").unwrap();
        let _t = comm.exchange(&Tensor::<f32, 1>::zeros([1])).unwrap();
        // Not committed on purpose: the forged frame above stands in for the neighbor's.
        comm.in_flight.push(Pending {
            seq: 0,
            shape: vec![1],
        });
        comm.issued.clear();
        assert!(matches!(comm.wait(), Err(Error::Topology(_))));
    }

    #[test]
    fn test_sequence_disagreement_is_topology_error() {
        let mut eps = LocalRing::new(2).unwrap();
        let b = Arc::new(eps.remove(1));
        let a = Arc::new(eps.remove(0));
        let mut ca = RingComm::new(a, "seq").unwrap();
        let mut cb = RingComm::new(b, "seq").unwrap();

        // Rank 1 sends two exchanges; rank 0 only made one and then a second in a new batch
        // after skipping one of its own.
        let x = Tensor::<f32, 1>::zeros([1]);
        let _ = cb.exchange(&x).unwrap();
        let _ = cb.exchange(&x).unwrap();
        cb.commit().unwrap();

        let _ = ca.exchange(&x).unwrap();
        ca.next_seq += 1;
        let _ = ca.exchange(&x).unwrap();
        ca.commit().unwrap();

        assert!(matches!(ca.wait(), Err(Error::Topology(_))));
        ca.in_flight.clear();
        cb.in_flight.clear();
    }
}
