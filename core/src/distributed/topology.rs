//! Ring topology and process-grid configuration.
//!
//! A job of `cp_size * dp_size` workers is laid out as a grid: consecutive global ranks form one
//! context-parallel ring, and ranks sharing a ring position form one data-parallel group.
//!
//! ```rust
//! use ringtrain::distributed::{ParallelConfig, ProcessGrid};
//!
//! let config = ParallelConfig { cp_size: 2, dp_size: 3 };
//! let grid = ProcessGrid::new(config, 5).unwrap();
//! assert_eq!((grid.cp_rank(), grid.dp_rank()), (1, 2));
//! assert_eq!(grid.dp_group_ranks(), vec![1, 3, 5]);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env::VarError;

/// Environment variable holding the context-parallel ring size.
pub const CP_SIZE_ENV: &str = "RINGTRAIN_CP_SIZE";
/// Environment variable holding the data-parallel group size.
pub const DP_SIZE_ENV: &str = "RINGTRAIN_DP_SIZE";

/// Position of one worker on a logical ring `0..world_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTopology {
    rank: usize,
    world_size: usize,
}

impl RingTopology {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Config("world size must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(Error::Config(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    pub const fn rank(&self) -> usize {
        self.rank
    }

    pub const fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank that receives this worker's sends.
    pub const fn next(&self) -> usize {
        (self.rank + 1) % self.world_size
    }

    /// Rank this worker receives from.
    pub const fn prev(&self) -> usize {
        (self.rank + self.world_size - 1) % self.world_size
    }

    /// Rank whose block is held locally after `step` rotations.
    pub const fn block_origin(&self, step: usize) -> usize {
        (self.rank + self.world_size - step % self.world_size) % self.world_size
    }

    /// Whether the block held at `step` contributes to local queries.
    ///
    /// With a causal mask, ranks only see blocks of earlier (or their own) sequence positions,
    /// which are exactly the first `rank + 1` steps of the rotation.
    pub const fn is_visible(&self, step: usize, causal: bool) -> bool {
        !causal || step <= self.rank
    }
}

/// Sizes of the parallel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "one")]
    pub cp_size: usize,
    #[serde(default = "one")]
    pub dp_size: usize,
}

fn one() -> usize {
    1
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            cp_size: 1,
            dp_size: 1,
        }
    }
}

impl ParallelConfig {
    pub const fn world_size(&self) -> usize {
        self.cp_size * self.dp_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.cp_size == 0 || self.dp_size == 0 {
            return Err(Error::Config(format!(
                "parallel sizes must be positive (cp_size = {}, dp_size = {})",
                self.cp_size, self.dp_size
            )));
        }
        Ok(())
    }

    /// Parses and validates a JSON document such as `{"cp_size": 4, "dp_size": 2}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("bad JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads [`CP_SIZE_ENV`] and [`DP_SIZE_ENV`]; unset variables default to 1.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|var| std::env::var(var))
    }

    /// Like [`ParallelConfig::from_env`], with variables looked up through `lookup`.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, VarError>,
    {
        let config = Self {
            cp_size: read_size(&lookup, CP_SIZE_ENV)?,
            dp_size: read_size(&lookup, DP_SIZE_ENV)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_size<F>(lookup: &F, var: &str) -> Result<usize>
where
    F: Fn(&str) -> std::result::Result<String, VarError>,
{
    match lookup(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{var}={raw:?}: {e}"))),
        Err(VarError::NotPresent) => Ok(1),
        Err(e) => Err(Error::Config(format!("{var}: {e}"))),
    }
}

/// One worker's coordinates in the `cp × dp` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGrid {
    config: ParallelConfig,
    global_rank: usize,
}

impl ProcessGrid {
    pub fn new(config: ParallelConfig, global_rank: usize) -> Result<Self> {
        config.validate()?;
        if global_rank >= config.world_size() {
            return Err(Error::Config(format!(
                "global rank {global_rank} out of range for world size {}",
                config.world_size()
            )));
        }
        Ok(Self {
            config,
            global_rank,
        })
    }

    pub const fn config(&self) -> ParallelConfig {
        self.config
    }

    pub const fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub const fn cp_rank(&self) -> usize {
        self.global_rank % self.config.cp_size
    }

    pub const fn dp_rank(&self) -> usize {
        self.global_rank / self.config.cp_size
    }

    /// Ring this worker attends over.
    pub fn cp_topology(&self) -> Result<RingTopology> {
        RingTopology::new(self.cp_rank(), self.config.cp_size)
    }

    /// Group this worker averages gradients with.
    pub fn dp_topology(&self) -> Result<RingTopology> {
        RingTopology::new(self.dp_rank(), self.config.dp_size)
    }

    /// Global ranks of this worker's context-parallel ring, in ring order.
    pub fn cp_group_ranks(&self) -> Vec<usize> {
        let base = self.dp_rank() * self.config.cp_size;
        (base..base + self.config.cp_size).collect()
    }

    /// Global ranks of this worker's data-parallel group.
    pub fn dp_group_ranks(&self) -> Vec<usize> {
        (0..self.config.dp_size)
            .map(|d| d * self.config.cp_size + self.cp_rank())
            .collect()
    }
}
