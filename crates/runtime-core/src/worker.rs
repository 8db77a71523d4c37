//! Process-group membership tracking

use crate::{Error, Rank, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Member state enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerState {
    /// Joined, waiting for the rest of the group
    Joined,

    /// Group complete, member participating in collectives
    Active,

    /// Member left the group gracefully
    Left,

    /// Member missed heartbeats
    Dead,
}

impl WorkerState {
    /// Returns true if the member still takes part in collectives
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Joined | WorkerState::Active)
    }
}

/// Information about one member of the process group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Rank supplied by the launcher
    pub rank: Rank,

    /// World size the member was launched with
    pub world_size: usize,

    /// Member hostname
    pub hostname: String,

    /// Current state
    pub state: WorkerState,

    /// Last heartbeat timestamp
    pub last_heartbeat: DateTime<Utc>,

    /// Join timestamp
    pub joined_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(rank: Rank, world_size: usize, hostname: String) -> Self {
        let now = Utc::now();
        Self {
            rank,
            world_size,
            hostname,
            state: WorkerState::Joined,
            last_heartbeat: now,
            joined_at: now,
        }
    }

    /// Check if the member is considered dead based on timeout
    pub fn is_dead(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed > timeout
    }
}

/// Thread-safe membership registry for a fixed-size group
///
/// Ranks come from the launcher; the registry only checks them. A group is
/// complete once every rank in `0..world_size` has joined exactly once.
pub struct WorkerRegistry {
    /// Map of rank to member info
    workers: DashMap<Rank, WorkerInfo>,

    /// Expected group size
    world_size: usize,

    /// Heartbeat timeout duration
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    /// Create a registry expecting `world_size` members
    pub fn new(world_size: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            world_size,
            heartbeat_timeout,
        }
    }

    /// Admit a member into the group
    pub fn join(&self, worker: WorkerInfo) -> Result<()> {
        if worker.world_size != self.world_size {
            return Err(Error::ShardTopology {
                expected_world_size: self.world_size,
                actual_world_size: worker.world_size,
            });
        }
        if worker.rank >= self.world_size {
            return Err(Error::coordination(
                "join",
                format!(
                    "rank {} out of range for world_size {}",
                    worker.rank, self.world_size
                ),
            ));
        }

        match self.workers.entry(worker.rank) {
            dashmap::mapref::entry::Entry::Occupied(existing)
                if existing.get().state.is_active() =>
            {
                Err(Error::coordination(
                    "join",
                    format!(
                        "rank {} already joined from host {}",
                        worker.rank,
                        existing.get().hostname
                    ),
                ))
            }
            entry => {
                info!(
                    rank = worker.rank,
                    world_size = worker.world_size,
                    hostname = %worker.hostname,
                    "Member joined"
                );
                // Release the shard lock before iterating the map again
                drop(entry.insert(worker));
                if self.is_complete() {
                    for mut member in self.workers.iter_mut() {
                        member.state = WorkerState::Active;
                    }
                    info!(world_size = self.world_size, "Process group complete");
                }
                Ok(())
            }
        }
    }

    /// Remove a member that is shutting down
    pub fn leave(&self, rank: Rank) -> Result<WorkerInfo> {
        let mut member = self.workers.get_mut(&rank).ok_or_else(|| {
            Error::coordination("leave", format!("rank {} is not a member", rank))
        })?;
        member.state = WorkerState::Left;
        info!(rank = rank, "Member left");
        Ok(member.clone())
    }

    /// Get member info by rank
    pub fn get(&self, rank: Rank) -> Option<WorkerInfo> {
        self.workers.get(&rank).map(|w| w.clone())
    }

    /// Record a heartbeat
    pub fn heartbeat(&self, rank: Rank) -> Result<WorkerState> {
        let mut member = self.workers.get_mut(&rank).ok_or_else(|| {
            Error::coordination("heartbeat", format!("rank {} is not a member", rank))
        })?;
        member.last_heartbeat = Utc::now();
        Ok(member.state)
    }

    /// Expected group size
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of members currently taking part
    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| entry.value().state.is_active())
            .count()
    }

    /// Whether every rank has joined and none has dropped out
    pub fn is_complete(&self) -> bool {
        self.active_count() == self.world_size
    }

    /// Get all members ordered by rank
    pub fn all_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<_> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        workers.sort_by_key(|w| w.rank);
        workers
    }

    /// Check for dead members and mark them
    pub fn check_dead_workers(&self) -> Vec<Rank> {
        let mut dead = Vec::new();

        for mut entry in self.workers.iter_mut() {
            if entry.value().state.is_active() && entry.value().is_dead(self.heartbeat_timeout) {
                warn!(
                    rank = *entry.key(),
                    last_heartbeat = ?entry.value().last_heartbeat,
                    "Member marked as dead"
                );
                entry.value_mut().state = WorkerState::Dead;
                dead.push(*entry.key());
            }
        }

        dead.sort_unstable();
        dead
    }
}

/// Thread-safe handle to the membership registry
pub type WorkerRegistryHandle = Arc<WorkerRegistry>;
