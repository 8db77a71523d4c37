//! Shard descriptors and layouts
//!
//! Shards are flat contiguous slices of the row-major flattened parameter.
//! `offset` is an element offset and `local_shape` the slice's own shape.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use runtime_core::{Error, Rank, Result};

use crate::tensor::numel;

/// The part of one parameter that one rank holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub parameter_name: String,
    pub owner_rank: Rank,
    pub local_shape: Vec<usize>,
    pub global_shape: Vec<usize>,
    pub offset: usize,
}

impl ShardDescriptor {
    pub fn local_numel(&self) -> usize {
        numel(&self.local_shape)
    }

    pub fn global_numel(&self) -> usize {
        numel(&self.global_shape)
    }

    /// Element range covered in the flattened parameter
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.local_numel()
    }
}

/// Descriptors for every parameter, one per rank
///
/// Construction checks that each parameter's shards tile its global shape
/// exactly: no gap, no overlap, one shard per rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    world_size: usize,
    /// Parameter name -> descriptors indexed by owner rank
    params: BTreeMap<String, Vec<ShardDescriptor>>,
}

impl ShardLayout {
    /// Split each parameter near-evenly; the first `numel % world_size`
    /// ranks hold one extra element
    pub fn even<I, S>(world_size: usize, shapes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<usize>)>,
        S: Into<String>,
    {
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world_size must be at least 1".to_string(),
            });
        }

        let mut descriptors = Vec::new();
        for (name, global_shape) in shapes {
            let name = name.into();
            let total = numel(&global_shape);
            let base = total / world_size;
            let extra = total % world_size;

            let mut offset = 0;
            for rank in 0..world_size {
                let len = base + usize::from(rank < extra);
                descriptors.push(ShardDescriptor {
                    parameter_name: name.clone(),
                    owner_rank: rank,
                    local_shape: vec![len],
                    global_shape: global_shape.clone(),
                    offset,
                });
                offset += len;
            }
        }

        Self::from_descriptors(world_size, descriptors)
    }

    /// Validate and index an arbitrary descriptor set
    pub fn from_descriptors(
        world_size: usize,
        descriptors: impl IntoIterator<Item = ShardDescriptor>,
    ) -> Result<Self> {
        let mut by_name: BTreeMap<String, Vec<ShardDescriptor>> = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.owner_rank >= world_size {
                return Err(Error::shard_mismatch(
                    &descriptor.parameter_name,
                    format!(
                        "owner rank {} out of range for world_size {}",
                        descriptor.owner_rank, world_size
                    ),
                ));
            }
            by_name
                .entry(descriptor.parameter_name.clone())
                .or_default()
                .push(descriptor);
        }

        for (name, shards) in by_name.iter_mut() {
            validate_coverage(name, world_size, shards)?;
            shards.sort_by_key(|d| d.owner_rank);
        }

        Ok(Self {
            world_size,
            params: by_name,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// All shards of one parameter, ordered by rank
    pub fn shards(&self, name: &str) -> Option<&[ShardDescriptor]> {
        self.params.get(name).map(Vec::as_slice)
    }

    /// The shard `rank` owns of parameter `name`
    pub fn descriptor(&self, name: &str, rank: Rank) -> Option<&ShardDescriptor> {
        self.params.get(name).and_then(|shards| shards.get(rank))
    }

    /// Every shard owned by `rank`, in parameter order
    pub fn descriptors_for(&self, rank: Rank) -> impl Iterator<Item = &ShardDescriptor> {
        self.params.values().filter_map(move |shards| shards.get(rank))
    }

    /// Every descriptor in parameter then rank order
    pub fn all_descriptors(&self) -> Vec<ShardDescriptor> {
        self.params.values().flatten().cloned().collect()
    }

    /// Global shape of parameter `name`
    pub fn global_shape(&self, name: &str) -> Option<&[usize]> {
        self.params
            .get(name)
            .and_then(|shards| shards.first())
            .map(|d| d.global_shape.as_slice())
    }

    /// Total number of elements across all parameters
    pub fn total_numel(&self) -> usize {
        self.params
            .values()
            .filter_map(|shards| shards.first())
            .map(ShardDescriptor::global_numel)
            .sum()
    }
}

fn validate_coverage(name: &str, world_size: usize, shards: &[ShardDescriptor]) -> Result<()> {
    let mut owners = vec![false; world_size];
    for shard in shards {
        if std::mem::replace(&mut owners[shard.owner_rank], true) {
            return Err(Error::shard_mismatch(
                name,
                format!("rank {} owns more than one shard", shard.owner_rank),
            ));
        }
    }
    if let Some(missing) = owners.iter().position(|owned| !owned) {
        return Err(Error::shard_mismatch(
            name,
            format!("rank {} owns no shard", missing),
        ));
    }

    let global_shape = &shards[0].global_shape;
    if let Some(other) = shards.iter().find(|d| &d.global_shape != global_shape) {
        return Err(Error::shard_mismatch(
            name,
            format!(
                "rank {} reports global shape {:?}, rank {} reports {:?}",
                shards[0].owner_rank, global_shape, other.owner_rank, other.global_shape
            ),
        ));
    }

    let mut by_offset: Vec<&ShardDescriptor> = shards.iter().collect();
    by_offset.sort_by_key(|d| (d.offset, d.local_numel()));

    let mut covered = 0;
    for shard in by_offset {
        if shard.offset != covered {
            let problem = if shard.offset < covered { "overlap" } else { "gap" };
            return Err(Error::shard_mismatch(
                name,
                format!(
                    "{} at element {}: rank {} starts at {}",
                    problem, covered, shard.owner_rank, shard.offset
                ),
            ));
        }
        covered += shard.local_numel();
    }

    let total = numel(global_shape);
    if covered != total {
        return Err(Error::shard_mismatch(
            name,
            format!("shards cover {} of {} elements", covered, total),
        ));
    }
    Ok(())
}
