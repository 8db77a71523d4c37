//! Per-epoch work plans
//!
//! Shuffles units within each bucket using `seed = base_seed + epoch`, cuts
//! them into full batches and interleaves the batches of all buckets by a
//! seeded shuffle of batch slots. A bucket with a larger batch size owns
//! fewer slots and so contributes proportionally fewer steps.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use runtime_core::{Epoch, Error, PartitionStrategy, Rank, Result, UnitId};

use crate::bucket::{BucketConfig, BucketKey};

/// One micro-batch handed to one rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub bucket: BucketKey,
    pub units: Vec<UnitId>,
}

/// The full epoch-long sequence of micro-batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochPlan {
    epoch: Epoch,
    seed: u64,
    world_size: usize,
    partition: PartitionStrategy,
    items: Vec<WorkItem>,
    /// Bucket index (in key order) of every slot
    bucket_order: Vec<u32>,
    /// Units not scheduled this epoch
    dropped_units: usize,
}

impl EpochPlan {
    pub fn build(
        config: &BucketConfig,
        base_seed: u64,
        epoch: Epoch,
        world_size: usize,
        partition: PartitionStrategy,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world_size must be at least 1".to_string(),
            });
        }

        let seed = base_seed.wrapping_add(epoch);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut batches: Vec<Vec<WorkItem>> = Vec::with_capacity(config.len());
        let mut slots: Vec<(u32, usize)> = Vec::new();
        let mut dropped_units = 0;

        for (index, (key, bucket)) in config.iter().enumerate() {
            let mut units = bucket.units.clone();
            units.shuffle(&mut rng);

            let chunks = units.chunks_exact(bucket.batch_size);
            dropped_units += chunks.remainder().len();
            let bucket_batches: Vec<WorkItem> = chunks
                .map(|chunk| WorkItem {
                    bucket: key.clone(),
                    units: chunk.to_vec(),
                })
                .collect();

            slots.extend((0..bucket_batches.len()).map(|b| (index as u32, b)));
            batches.push(bucket_batches);
        }

        slots.shuffle(&mut rng);

        // Equal step counts on every rank keep later collectives aligned
        let usable = slots.len() - slots.len() % world_size;
        for &(bucket, batch) in &slots[usable..] {
            dropped_units += batches[bucket as usize][batch].units.len();
        }
        slots.truncate(usable);

        let bucket_order = slots.iter().map(|&(bucket, _)| bucket).collect();
        let items = slots
            .iter()
            .map(|&(bucket, batch)| batches[bucket as usize][batch].clone())
            .collect();

        Ok(Self {
            epoch,
            seed,
            world_size,
            partition,
            items,
            bucket_order,
            dropped_units,
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Seed the plan was shuffled with
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Micro-batches each rank processes this epoch
    pub fn steps_per_rank(&self) -> u64 {
        (self.items.len() / self.world_size) as u64
    }

    /// Micro-batches across all ranks
    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    pub fn dropped_units(&self) -> usize {
        self.dropped_units
    }

    /// Bucket index of every slot in sequence order
    pub fn bucket_assignment_order(&self) -> &[u32] {
        &self.bucket_order
    }

    /// The item `rank` processes at `position`
    pub fn item_for(&self, rank: Rank, position: u64) -> Option<&WorkItem> {
        if rank >= self.world_size || position >= self.steps_per_rank() {
            return None;
        }
        let position = position as usize;
        let index = match self.partition {
            PartitionStrategy::RoundRobin => position * self.world_size + rank,
            PartitionStrategy::Contiguous => rank * self.steps_per_rank() as usize + position,
        };
        self.items.get(index)
    }

    /// Every item `rank` processes, in order
    pub fn items_for(&self, rank: Rank) -> Vec<&WorkItem> {
        (0..self.steps_per_rank())
            .filter_map(|position| self.item_for(rank, position))
            .collect()
    }
}
