//! Resumable per-rank scheduling

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use runtime_core::{
    Epoch, Error, PartitionStrategy, Rank, Result, SchedulerConfig, WorkerCoordinator,
};

use crate::bucket::BucketConfig;
use crate::epoch::{EpochPlan, WorkItem};

/// Everything needed to resume scheduling exactly where it stopped
///
/// The cursor is the same on every rank because every rank takes the same
/// number of steps per epoch, so one value describes the whole group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_seed: u64,
    pub epoch: Epoch,
    pub world_size: usize,
    pub bucket_assignment_order: Vec<u32>,
    pub per_rank_cursor: u64,
}

impl SchedulerState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Next item for `rank` and the state after taking it
///
/// Returns `None` and an unchanged state once the epoch is exhausted or when
/// `state` does not describe `plan`'s epoch.
pub fn advance(
    plan: &EpochPlan,
    rank: Rank,
    state: &SchedulerState,
) -> (Option<WorkItem>, SchedulerState) {
    if state.epoch != plan.epoch() {
        return (None, state.clone());
    }
    match plan.item_for(rank, state.per_rank_cursor) {
        Some(item) => {
            let mut next = state.clone();
            next.per_rank_cursor += 1;
            (Some(item.clone()), next)
        }
        None => (None, state.clone()),
    }
}

/// What each rank claims at an epoch boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct EpochClaim {
    base_seed: u64,
    epoch: Epoch,
    world_size: usize,
    fingerprint: u64,
}

/// Hands this rank its micro-batches for the current epoch
pub struct WorkScheduler {
    buckets: BucketConfig,
    base_seed: u64,
    partition: PartitionStrategy,
    rank: Rank,
    world_size: usize,
    plan: EpochPlan,
    cursor: u64,
}

impl WorkScheduler {
    /// Plan epoch 0 locally; call `start_epoch` or `restore` before training
    pub fn new(
        buckets: BucketConfig,
        config: &SchedulerConfig,
        rank: Rank,
        world_size: usize,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} out of range for world_size {}", rank, world_size),
            });
        }
        let plan = EpochPlan::build(&buckets, config.base_seed, 0, world_size, config.partition)?;
        Ok(Self {
            buckets,
            base_seed: config.base_seed,
            partition: config.partition,
            rank,
            world_size,
            plan,
            cursor: 0,
        })
    }

    /// Collectively agree on `(base_seed, epoch)` and plan `epoch` from its start
    pub async fn start_epoch(&mut self, coordinator: &WorkerCoordinator, epoch: Epoch) -> Result<()> {
        self.check_agreement(coordinator, self.base_seed, epoch).await?;

        self.plan = self.build_plan(epoch)?;
        self.cursor = 0;

        info!(
            rank = self.rank,
            epoch = epoch,
            seed = self.plan.seed(),
            steps = self.plan.steps_per_rank(),
            dropped_units = self.plan.dropped_units(),
            "Epoch planned"
        );
        Ok(())
    }

    /// Resume from a saved state, mid-epoch if the cursor says so
    pub async fn restore(
        &mut self,
        coordinator: &WorkerCoordinator,
        state: &SchedulerState,
    ) -> Result<()> {
        if state.world_size != coordinator.world_size() {
            return Err(Error::ShardTopology {
                expected_world_size: state.world_size,
                actual_world_size: coordinator.world_size(),
            });
        }
        if state.base_seed != self.base_seed {
            warn!(
                configured = self.base_seed,
                saved = state.base_seed,
                "Configured base seed differs from saved state, using saved seed"
            );
            self.base_seed = state.base_seed;
        }

        self.check_agreement(coordinator, state.base_seed, state.epoch)
            .await?;

        let plan = self.build_plan(state.epoch)?;
        if plan.bucket_assignment_order() != state.bucket_assignment_order.as_slice() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "bucket configuration no longer reproduces the saved order for epoch {}",
                    state.epoch
                ),
            });
        }
        self.plan = plan;
        self.set_cursor(state.per_rank_cursor)?;

        info!(
            rank = self.rank,
            epoch = state.epoch,
            cursor = self.cursor,
            "Scheduler restored"
        );
        Ok(())
    }

    /// Next micro-batch for this rank, or `None` at epoch end
    pub fn advance(&mut self) -> Option<WorkItem> {
        let (item, next) = advance(&self.plan, self.rank, &self.state());
        self.cursor = next.per_rank_cursor;
        if let Some(item) = &item {
            debug!(rank = self.rank, cursor = self.cursor, bucket = %item.bucket, "Work item issued");
        }
        item
    }

    /// Position within the current epoch
    pub fn set_cursor(&mut self, position: u64) -> Result<()> {
        if position > self.plan.steps_per_rank() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "cursor {} beyond epoch length {}",
                    position,
                    self.plan.steps_per_rank()
                ),
            });
        }
        self.cursor = position;
        Ok(())
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn epoch(&self) -> Epoch {
        self.plan.epoch()
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn plan(&self) -> &EpochPlan {
        &self.plan
    }

    pub fn steps_per_epoch(&self) -> u64 {
        self.plan.steps_per_rank()
    }

    pub fn is_epoch_done(&self) -> bool {
        self.cursor >= self.plan.steps_per_rank()
    }

    /// Snapshot for checkpointing
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            base_seed: self.base_seed,
            epoch: self.plan.epoch(),
            world_size: self.world_size,
            bucket_assignment_order: self.plan.bucket_assignment_order().to_vec(),
            per_rank_cursor: self.cursor,
        }
    }

    fn build_plan(&self, epoch: Epoch) -> Result<EpochPlan> {
        EpochPlan::build(
            &self.buckets,
            self.base_seed,
            epoch,
            self.world_size,
            self.partition,
        )
    }

    async fn check_agreement(
        &self,
        coordinator: &WorkerCoordinator,
        base_seed: u64,
        epoch: Epoch,
    ) -> Result<()> {
        let claim = EpochClaim {
            base_seed,
            epoch,
            world_size: self.world_size,
            fingerprint: self.buckets.fingerprint(),
        };
        let claims = coordinator.all_gather("scheduler_epoch_check", &claim).await?;

        let expected = claims[0];
        for (rank, actual) in claims.iter().enumerate() {
            if actual.world_size != expected.world_size {
                return Err(Error::ShardTopology {
                    expected_world_size: expected.world_size,
                    actual_world_size: actual.world_size,
                });
            }
            if actual != &expected {
                if actual.fingerprint != expected.fingerprint {
                    warn!(rank = rank, "Bucket configuration differs from rank 0");
                }
                return Err(Error::SchedulerDesync {
                    rank,
                    expected_seed: expected.base_seed,
                    actual_seed: actual.base_seed,
                    expected_epoch: expected.epoch,
                    actual_epoch: actual.epoch,
                });
            }
        }
        Ok(())
    }
}
