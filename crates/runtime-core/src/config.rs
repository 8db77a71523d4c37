//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Coordinator settings
    pub coordinator: CoordinatorConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Shadow parameter settings
    pub ema: EmaConfig,

    /// Work scheduler settings
    pub scheduler: SchedulerConfig,

    /// Instrumentation settings
    pub perf: PerfConfig,

    /// Training loop settings
    pub training: TrainingConfig,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject values no run could work with
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.coordinator.join_timeout.is_zero() {
            return invalid("coordinator.join_timeout must be non-zero");
        }
        if self.coordinator.collective_timeout.is_zero() {
            return invalid("coordinator.collective_timeout must be non-zero");
        }
        if self.checkpoint.keep_count == 0 {
            return invalid("checkpoint.keep_count must be at least 1");
        }
        if let CheckpointStrategy::Steps { interval: 0 } = self.checkpoint.strategy {
            return invalid("checkpoint.strategy interval must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.ema.decay) {
            return invalid("ema.decay must be within [0, 1]");
        }
        if self.perf.window == 0 {
            return invalid("perf.window must be at least 1");
        }
        if self.training.log_every == 0 {
            return invalid("training.log_every must be at least 1");
        }
        if let Some(norm) = self.training.max_grad_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return invalid("training.max_grad_norm must be positive and finite");
            }
        }
        Ok(())
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Rendezvous server address (used by the gRPC process group)
    pub address: String,

    /// Bound on joining the group at startup
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Bound on any single collective
    #[serde(with = "humantime_serde")]
    pub collective_timeout: Duration,

    /// Membership heartbeat interval
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// A member missing heartbeats for this long is considered unreachable
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:50051".to_string(),
            join_timeout: Duration::from_secs(120),
            collective_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root directory for checkpoints
    pub base_path: String,

    /// Checkpoint strategy
    pub strategy: CheckpointStrategy,

    /// Also save after the last step of every epoch
    pub save_on_epoch_end: bool,

    /// Number of committed checkpoints to keep
    pub keep_count: usize,

    /// Gather live parameters into per-parameter files on the final save
    pub consolidate_live_on_final: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            base_path: "./checkpoints".to_string(),
            strategy: CheckpointStrategy::default(),
            save_on_epoch_end: true,
            keep_count: 5,
            consolidate_live_on_final: false,
        }
    }
}

/// Checkpoint strategy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStrategy {
    /// Checkpoint every N global steps
    Steps { interval: u64 },

    /// No automatic checkpointing (manual only)
    Manual,
}

impl CheckpointStrategy {
    /// Whether a checkpoint is due after `global_step` steps have completed
    pub fn is_due(&self, global_step: u64) -> bool {
        match self {
            CheckpointStrategy::Steps { interval } => {
                *interval > 0 && global_step > 0 && global_step % interval == 0
            }
            CheckpointStrategy::Manual => false,
        }
    }
}

impl Default for CheckpointStrategy {
    fn default() -> Self {
        CheckpointStrategy::Steps { interval: 1000 }
    }
}

/// Shadow parameter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    /// Target decay once warm-up is over
    pub decay: f32,

    /// Steps during which the shadow tracks live exactly
    pub warmup_steps: u64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            decay: 0.9999,
            warmup_steps: 0,
        }
    }
}

/// Work scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base seed; the epoch seed is `base_seed + epoch`
    pub base_seed: u64,

    /// How the epoch sequence is split across ranks
    pub partition: PartitionStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_seed: 1024,
            partition: PartitionStrategy::RoundRobin,
        }
    }
}

/// Partitioning of the epoch-long work sequence across ranks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionStrategy {
    /// Position `p` of rank `r` is global slot `p * world_size + r`
    #[default]
    RoundRobin,

    /// Rank `r` owns one contiguous block of the sequence
    Contiguous,
}

/// Instrumentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    /// Record phase timings
    pub enabled: bool,

    /// Number of recent iterations averaged in reports
    pub window: usize,

    /// Iterations ignored at the start of a fit
    pub warmup_iters: usize,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 100,
            warmup_iters: 2,
        }
    }
}

/// Training loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of epochs to train
    pub epochs: u64,

    /// Report the averaged loss every N global steps
    pub log_every: u64,

    /// Clip gradients to this global L2 norm
    pub max_grad_norm: Option<f32>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            log_every: 1,
            max_grad_norm: None,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
