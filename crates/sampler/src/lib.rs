//! Bucketed work scheduling for distributed training
//!
//! This crate provides:
//! - **Bucket configuration**: work units grouped by shape class, each
//!   bucket with its own batch size
//! - **Epoch plans**: a seeded, deterministic epoch-long sequence of
//!   micro-batches, interleaved across buckets and split across ranks
//! - **Resumable scheduling**: an explicit, serializable cursor plus a pure
//!   `advance` function, guarded by a collective check that all ranks agree
//!   on seed and epoch
//!
//! # Example
//!
//! ```rust
//! use sampler::{BucketConfig, BucketKey, EpochPlan};
//! use runtime_core::PartitionStrategy;
//!
//! let mut buckets = BucketConfig::new();
//! buckets.add_bucket(BucketKey::new("256x256", 16), 4, 0..40).unwrap();
//! buckets.add_bucket(BucketKey::new("512x512", 16), 2, 40..60).unwrap();
//!
//! let plan = EpochPlan::build(&buckets, 42, 0, 2, PartitionStrategy::RoundRobin).unwrap();
//! let first = plan.item_for(0, 0).unwrap();
//! assert!(!first.units.is_empty());
//! ```

mod bucket;
mod epoch;
mod scheduler;

pub use bucket::{Bucket, BucketConfig, BucketKey};
pub use epoch::{EpochPlan, WorkItem};
pub use scheduler::{advance, SchedulerState, WorkScheduler};
