//! Point-to-point ring transport.
//!
//! [`RingTransport`] is the only thing the ring engine needs from the process-group layer: who am
//! I, how many of us are there, send to my successor, receive from my predecessor. [`LocalRing`]
//! wires `W` in-process endpoints together with `crossbeam` channels so a whole ring can run on
//! threads of one process.

use super::topology::{ParallelConfig, ProcessGrid, RingTopology};
use crate::error::{Error, Result};
use crate::tensor::{Cpu, Tensor, TensorElem, TensorError};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Unit of data moving between neighbors.
///
/// The payload is always `f64`, which holds `f32` and `f64` blocks without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    /// Per-channel counter of the sender; both neighbors must agree on it.
    pub seq: u64,
    /// Rank of the sender.
    pub origin: usize,
    /// World size as seen by the sender.
    pub world_size: usize,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Frame {
    pub fn from_tensor<T: TensorElem, const RANK: usize>(
        channel: &str,
        seq: u64,
        topology: RingTopology,
        tensor: &Tensor<T, RANK, Cpu>,
    ) -> Result<Self> {
        let data = tensor
            .data()
            .iter()
            .map(|x| x.to_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| TensorError::Unsupported("element not representable as f64".into()))?;
        Ok(Self {
            channel: channel.to_owned(),
            seq,
            origin: topology.rank(),
            world_size: topology.world_size(),
            shape: tensor.shape().to_vec(),
            data,
        })
    }

    /// Converts the payload back into a tensor of the expected shape.
    pub fn into_tensor<T: TensorElem, const RANK: usize>(
        self,
        shape: [usize; RANK],
    ) -> Result<Tensor<T, RANK, Cpu>> {
        if self.shape != shape {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape,
            }
            .into());
        }
        let data = self
            .data
            .into_iter()
            .map(T::from_f64)
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| TensorError::Unsupported("received value out of range".into()))?;
        Ok(Tensor::new(data, shape)?)
    }
}

/// Send-to-next / receive-from-previous on a fixed ring.
pub trait RingTransport: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Hands `frame` to the next rank. Must not wait for the receiver.
    fn send_next(&self, frame: Frame) -> Result<()>;

    /// Blocks until the previous rank's next frame on `channel` arrives.
    fn recv_prev(&self, channel: &str) -> Result<Frame>;

    fn topology(&self) -> Result<RingTopology> {
        RingTopology::new(self.rank(), self.world_size())
    }
}

/// Factory for in-process rings.
pub struct LocalRing;

impl LocalRing {
    /// Creates `world_size` endpoints; endpoint `i` sends to `(i + 1) % world_size`.
    ///
    /// Each endpoint is meant to be moved to its own thread.
    pub fn new(world_size: usize) -> Result<Vec<LocalEndpoint>> {
        if world_size == 0 {
            return Err(Error::Config("a ring needs at least one rank".into()));
        }

        let (mut senders, inboxes): (Vec<Sender<Frame>>, Vec<Receiver<Frame>>) =
            (0..world_size).map(|_| channel::unbounded()).unzip();
        // Endpoint i holds the sender into inbox i + 1.
        senders.rotate_left(1);

        senders
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (to_next, inbox))| {
                Ok(LocalEndpoint {
                    topology: RingTopology::new(rank, world_size)?,
                    to_next,
                    inbox,
                    stash: Mutex::new(HashMap::new()),
                })
            })
            .collect()
    }

    /// Creates every endpoint of a `cp_size × dp_size` job, indexed by global rank.
    ///
    /// Each data-parallel replica gets its own context-parallel ring and each ring position gets
    /// its own data-parallel ring, laid out as [`ProcessGrid`] describes.
    pub fn grid(config: ParallelConfig) -> Result<Vec<GridEndpoints>> {
        config.validate()?;
        let build = |rings: usize, size: usize| -> Result<Vec<Vec<Option<LocalEndpoint>>>> {
            (0..rings)
                .map(|_| -> Result<Vec<Option<LocalEndpoint>>> {
                    Ok(Self::new(size)?.into_iter().map(Some).collect())
                })
                .collect()
        };
        let mut cp_rings = build(config.dp_size, config.cp_size)?;
        let mut dp_rings = build(config.cp_size, config.dp_size)?;

        (0..config.world_size())
            .map(|global_rank| {
                let grid = ProcessGrid::new(config, global_rank)?;
                let (cp_rank, dp_rank) = (grid.cp_rank(), grid.dp_rank());
                let cp = cp_rings[dp_rank][cp_rank].take();
                let dp = dp_rings[cp_rank][dp_rank].take();
                match (cp, dp) {
                    (Some(cp), Some(dp)) => Ok(GridEndpoints { grid, cp, dp }),
                    _ => Err(Error::Topology(format!(
                        "grid slot ({cp_rank}, {dp_rank}) handed out twice"
                    ))),
                }
            })
            .collect()
    }
}

/// One worker's endpoints in a [`LocalRing::grid`].
#[derive(Debug)]
pub struct GridEndpoints {
    pub grid: ProcessGrid,
    /// Ring over the worker's sequence slices, ranked by `grid.cp_rank()`.
    pub cp: LocalEndpoint,
    /// Ring over the replicas holding the same slice, ranked by `grid.dp_rank()`.
    pub dp: LocalEndpoint,
}

/// One rank's view of a [`LocalRing`].
///
/// All channels share one inbox; frames for channels nobody is waiting on yet are parked until
/// asked for.
#[derive(Debug)]
pub struct LocalEndpoint {
    topology: RingTopology,
    to_next: Sender<Frame>,
    inbox: Receiver<Frame>,
    stash: Mutex<HashMap<String, VecDeque<Frame>>>,
}

impl RingTransport for LocalEndpoint {
    fn rank(&self) -> usize {
        self.topology.rank()
    }

    fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    fn send_next(&self, frame: Frame) -> Result<()> {
        let channel = frame.channel.clone();
        self.to_next.send(frame).map_err(|_| Error::Comm {
            channel,
            reason: format!("rank {} is gone", self.topology.next()),
        })
    }

    fn recv_prev(&self, channel: &str) -> Result<Frame> {
        let mut stash = self.stash.lock().map_err(|_| Error::Comm {
            channel: channel.to_owned(),
            reason: "receive state poisoned by a panicked thread".into(),
        })?;

        if let Some(frame) = stash.get_mut(channel).and_then(VecDeque::pop_front) {
            return Ok(frame);
        }

        loop {
            let frame = self.inbox.recv().map_err(|_| Error::Comm {
                channel: channel.to_owned(),
                reason: format!("rank {} is gone", self.topology.prev()),
            })?;
            if frame.channel == channel {
                return Ok(frame);
            }
            stash.entry(frame.channel.clone()).or_default().push_back(frame);
        }
    }
}
