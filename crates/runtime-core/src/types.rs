//! Core type definitions for the training orchestration layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier types
pub type Rank = usize;
pub type CheckpointId = String;
pub type UnitId = u64;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Global training progress
///
/// `global_step` only moves forward within a process lifetime. A resumed run
/// starts from exactly the value recorded at the last committed checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Current epoch
    pub epoch: Epoch,

    /// Steps completed within the current epoch
    pub step_in_epoch: Step,

    /// Steps completed since the start of training
    pub global_step: Step,

    /// Position of the work scheduler's cursor within the epoch
    pub scheduler_cursor: u64,
}

impl TrainingProgress {
    /// Create progress for a fresh run
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed step
    pub fn complete_step(&mut self, scheduler_cursor: u64) {
        self.step_in_epoch += 1;
        self.global_step += 1;
        self.scheduler_cursor = scheduler_cursor;
    }

    /// Move to the start of `epoch`, keeping the global step
    pub fn begin_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.step_in_epoch = 0;
        self.scheduler_cursor = 0;
    }

    /// Checkpoint identifier for this point in training
    pub fn checkpoint_id(&self) -> CheckpointId {
        format!("epoch{}-global_step{}", self.epoch, self.global_step)
    }
}

/// Metadata describing a committed checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Unique checkpoint identifier
    pub id: CheckpointId,

    /// Progress captured by the checkpoint
    pub progress: TrainingProgress,

    /// World size at save time
    pub world_size: usize,

    /// Storage path relative to the checkpoint root
    pub path: String,

    /// Timestamp when the checkpoint was committed
    pub created_at: DateTime<Utc>,

    /// Whether a consolidated copy of the live parameters was written
    pub live_consolidated: bool,
}
