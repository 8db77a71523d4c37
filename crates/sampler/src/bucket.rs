//! Bucket configuration

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use runtime_core::{Error, Result, UnitId};

/// Shape class shared by the units of one bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub resolution: String,
    pub num_frames: u32,
}

impl BucketKey {
    pub fn new(resolution: impl Into<String>, num_frames: u32) -> Self {
        Self {
            resolution: resolution.into(),
            num_frames,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}f", self.resolution, self.num_frames)
    }
}

/// A pool of work units and the batch size they are drawn with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub batch_size: usize,
    pub units: Vec<UnitId>,
}

impl Bucket {
    /// Full batches this bucket yields per epoch
    pub fn num_batches(&self) -> usize {
        self.units.len() / self.batch_size
    }
}

/// Partition of the epoch's work units into buckets
///
/// Every unit belongs to exactly one bucket; adding a unit twice is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    buckets: BTreeMap<BucketKey, Bucket>,
}

impl BucketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bucket of `units` drawn in batches of `batch_size`
    pub fn add_bucket(
        &mut self,
        key: BucketKey,
        batch_size: usize,
        units: impl IntoIterator<Item = UnitId>,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: format!("bucket {} has batch size 0", key),
            });
        }
        if self.buckets.contains_key(&key) {
            return Err(Error::InvalidConfig {
                message: format!("bucket {} defined twice", key),
            });
        }

        let units: Vec<UnitId> = units.into_iter().collect();
        let mut seen: HashSet<UnitId> = self.units().collect();
        for unit in &units {
            if !seen.insert(*unit) {
                return Err(Error::InvalidConfig {
                    message: format!("work unit {} assigned to more than one bucket", unit),
                });
            }
        }

        self.buckets.insert(key, Bucket { batch_size, units });
        Ok(())
    }

    /// Buckets in key order
    pub fn iter(&self) -> impl Iterator<Item = (&BucketKey, &Bucket)> {
        self.buckets.iter()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> {
        self.buckets.get(key)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Every unit across all buckets
    pub fn units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.buckets.values().flat_map(|b| b.units.iter().copied())
    }

    pub fn total_units(&self) -> usize {
        self.buckets.values().map(|b| b.units.len()).sum()
    }

    /// Stable digest of keys, batch sizes and unit order
    ///
    /// Ranks compare fingerprints at epoch start to detect diverging inputs.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for (key, bucket) in &self.buckets {
            hasher.write(key.resolution.as_bytes());
            hasher.write_u8(0);
            hasher.write_u32(key.num_frames);
            hasher.write_u64(bucket.batch_size as u64);
            hasher.write_u64(bucket.units.len() as u64);
            for unit in &bucket.units {
                hasher.write_u64(*unit);
            }
        }
        hasher.finish()
    }
}
