//! Runtime Core - Foundation for the training orchestration layer
//!
//! Provides the error taxonomy, shared types, configuration, the collective
//! transport and the per-rank `WorkerCoordinator` used by every other crate.

pub mod collective;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod perf;
pub mod types;
pub mod worker;

pub use collective::{LocalProcessGroup, ProcessGroup, Rendezvous, RendezvousHandle, RoundKind};
pub use config::{
    CheckpointConfig, CheckpointStrategy, CoordinatorConfig, EmaConfig, PartitionStrategy,
    PerfConfig, RuntimeConfig, SchedulerConfig, TrainingConfig,
};
pub use coordinator::{hostname, LaunchInfo, WorkerCoordinator, WorkerCoordinatorHandle};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use metrics::{MemorySink, MetricsSink, MetricsSinkHandle, TracingSink};
pub use perf::{PerfReport, PerformanceInstrumentor, Phase};
pub use types::*;
pub use worker::{WorkerInfo, WorkerRegistry, WorkerRegistryHandle, WorkerState};
