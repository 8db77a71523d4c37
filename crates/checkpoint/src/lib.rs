//! Checkpoint management for distributed training
//!
//! A checkpoint bundles training progress, the live and shadow parameter
//! sets, an opaque optimizer blob per rank and the scheduler state. It is
//! staged in a hidden directory and committed by a single rename, so a
//! reader sees either the whole checkpoint or nothing.

pub mod format;
pub mod manager;
pub mod writer;

pub use manager::{
    CheckpointManager, CheckpointManagerHandle, CheckpointState, LoadedCheckpoint, SaveOptions,
};
pub use writer::CheckpointWriter;
