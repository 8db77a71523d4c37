//! Params - Sharded parameter sets for the training orchestration layer
//!
//! A logical parameter set is split into flat contiguous slices, one per
//! rank. [`ShardedParameterStore`] reconstructs full tensors on the leader
//! and hands slices back out; [`EmaTracker`] maintains the shadow copy on
//! each rank's own slice without any communication.

mod ema;
mod set;
mod shard;
mod store;
mod tensor;

pub use ema::EmaTracker;
pub use set::{LocalShard, ParameterSet};
pub use shard::{ShardDescriptor, ShardLayout};
pub use store::{FullParameters, ShardedParameterStore};
pub use tensor::{checked_numel, DType, Tensor};
