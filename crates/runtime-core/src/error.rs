//! Error types for the training orchestration layer

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training orchestration layer
#[derive(Error, Debug)]
pub enum Error {
    // Coordination errors
    #[error("Coordination failed during {operation}: {reason}")]
    Coordination { operation: String, reason: String },

    // Parameter sharding errors
    #[error("Shard mismatch for parameter '{parameter}': {reason}")]
    ShardMismatch { parameter: String, reason: String },

    #[error(
        "Shard topology mismatch: expected world_size {expected_world_size}, got {actual_world_size}"
    )]
    ShardTopology {
        expected_world_size: usize,
        actual_world_size: usize,
    },

    // Scheduler errors
    #[error(
        "Scheduler desync on rank {rank}: expected (seed={expected_seed}, epoch={expected_epoch}), got (seed={actual_seed}, epoch={actual_epoch})"
    )]
    SchedulerDesync {
        rank: usize,
        expected_seed: u64,
        actual_seed: u64,
        expected_epoch: u64,
        actual_epoch: u64,
    },

    // Checkpoint errors
    #[error("Checkpoint write failed: {checkpoint_id} - {reason}")]
    CheckpointWrite { checkpoint_id: String, reason: String },

    #[error("Checkpoint load failed: {checkpoint_id} - {reason}")]
    CheckpointLoad { checkpoint_id: String, reason: String },

    // Instrumentation errors
    #[error("Phase marked out of order: expected {expected}, got {actual}")]
    PhaseOrder { expected: String, actual: String },

    // Training signal errors
    #[error("Non-finite {what} at global step {global_step}")]
    NonFinite { what: String, global_step: u64 },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for a coordination failure
    pub fn coordination(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Coordination {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a shard mismatch on one parameter
    pub fn shard_mismatch(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ShardMismatch {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is retryable
    ///
    /// Only a failed checkpoint write leaves every rank in a consistent state
    /// from which the same call can be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CheckpointWrite { .. } | Error::Storage { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    ///
    /// Collective and topology failures mean peers may have diverged; the
    /// only sanctioned recovery is restarting and reloading a checkpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Coordination { .. }
                | Error::ShardMismatch { .. }
                | Error::ShardTopology { .. }
                | Error::SchedulerDesync { .. }
                | Error::CheckpointLoad { .. }
                | Error::PhaseOrder { .. }
                | Error::NonFinite { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Process exit code for fatal errors, one per invariant family
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Coordination { .. } => 10,
            Error::ShardMismatch { .. } => 11,
            Error::ShardTopology { .. } => 12,
            Error::SchedulerDesync { .. } => 13,
            Error::CheckpointWrite { .. } => 14,
            Error::CheckpointLoad { .. } => 15,
            Error::NonFinite { .. } => 16,
            Error::InvalidConfig { .. } => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
