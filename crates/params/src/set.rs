//! The slices of a parameter set held by one rank

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use runtime_core::{Error, Rank, Result};

use crate::shard::{ShardDescriptor, ShardLayout};
use crate::tensor::Tensor;

/// One locally held slice and the descriptor it was cut by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalShard {
    pub descriptor: ShardDescriptor,
    pub tensor: Tensor,
}

/// Ordered mapping from parameter name to this rank's slice
///
/// Two instances exist per run: the live set the optimizer mutates and the
/// shadow set only the EMA tracker mutates. Cloning is a deep copy, so a
/// shadow built from live never aliases it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    rank: Rank,
    shards: BTreeMap<String, LocalShard>,
}

impl ParameterSet {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            shards: BTreeMap::new(),
        }
    }

    /// Cut this rank's slices out of full tensors
    pub fn from_full(
        layout: &ShardLayout,
        rank: Rank,
        full: &BTreeMap<String, Tensor>,
    ) -> Result<Self> {
        let mut set = Self::new(rank);
        for descriptor in layout.descriptors_for(rank) {
            let name = &descriptor.parameter_name;
            let tensor = full
                .get(name)
                .ok_or_else(|| Error::shard_mismatch(name, "missing from full parameter set"))?;
            if tensor.shape() != descriptor.global_shape.as_slice() {
                return Err(Error::shard_mismatch(
                    name,
                    format!(
                        "full tensor has shape {:?}, layout expects {:?}",
                        tensor.shape(),
                        descriptor.global_shape
                    ),
                ));
            }
            let slice = tensor.data()[descriptor.range()].to_vec();
            set.insert(
                descriptor.clone(),
                Tensor::new(descriptor.local_shape.clone(), slice)?,
            )?;
        }
        Ok(set)
    }

    /// Zero-filled slices for every parameter `rank` owns
    pub fn zeros(layout: &ShardLayout, rank: Rank) -> Self {
        let shards = layout
            .descriptors_for(rank)
            .map(|d| {
                let shard = LocalShard {
                    descriptor: d.clone(),
                    tensor: Tensor::zeros(d.local_shape.clone()),
                };
                (d.parameter_name.clone(), shard)
            })
            .collect();
        Self { rank, shards }
    }

    /// Add a slice, checking it against its descriptor
    pub fn insert(&mut self, descriptor: ShardDescriptor, tensor: Tensor) -> Result<()> {
        let name = descriptor.parameter_name.clone();
        if descriptor.owner_rank != self.rank {
            return Err(Error::shard_mismatch(
                &name,
                format!(
                    "descriptor owned by rank {}, set belongs to rank {}",
                    descriptor.owner_rank, self.rank
                ),
            ));
        }
        if tensor.shape() != descriptor.local_shape.as_slice() {
            return Err(Error::shard_mismatch(
                &name,
                format!(
                    "tensor shape {:?} does not match local shape {:?}",
                    tensor.shape(),
                    descriptor.local_shape
                ),
            ));
        }
        self.shards.insert(name, LocalShard { descriptor, tensor });
        Ok(())
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn get(&self, name: &str) -> Option<&LocalShard> {
        self.shards.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut LocalShard> {
        self.shards.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LocalShard)> {
        self.shards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut LocalShard)> {
        self.shards.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Elements held locally
    pub fn numel(&self) -> usize {
        self.shards.values().map(|s| s.tensor.numel()).sum()
    }

    pub fn descriptors(&self) -> Vec<ShardDescriptor> {
        self.shards.values().map(|s| s.descriptor.clone()).collect()
    }

    /// Check that this set holds exactly `rank`'s slices of `layout`
    pub fn check_against(&self, layout: &ShardLayout) -> Result<()> {
        for expected in layout.descriptors_for(self.rank) {
            let name = &expected.parameter_name;
            let shard = self
                .shards
                .get(name)
                .ok_or_else(|| Error::shard_mismatch(name, "missing from local set"))?;
            if &shard.descriptor != expected {
                return Err(Error::shard_mismatch(
                    name,
                    format!(
                        "held offset {} shape {:?}, layout says offset {} shape {:?}",
                        shard.descriptor.offset,
                        shard.descriptor.local_shape,
                        expected.offset,
                        expected.local_shape
                    ),
                ));
            }
            if shard.tensor.numel() != expected.local_numel() {
                return Err(Error::shard_mismatch(
                    name,
                    format!(
                        "tensor holds {} elements, descriptor {}",
                        shard.tensor.numel(),
                        expected.local_numel()
                    ),
                ));
            }
        }
        if let Some(extra) = self
            .shards
            .keys()
            .find(|name| layout.descriptor(name, self.rank).is_none())
        {
            return Err(Error::shard_mismatch(extra, "not part of the layout"));
        }
        Ok(())
    }

    /// Exact equality on names, descriptors and element bit patterns
    pub fn bit_eq(&self, other: &ParameterSet) -> bool {
        self.rank == other.rank
            && self.shards.len() == other.shards.len()
            && self.shards.iter().zip(&other.shards).all(|((a_name, a), (b_name, b))| {
                a_name == b_name && a.descriptor == b.descriptor && a.tensor.bit_eq(&b.tensor)
            })
    }

    /// Sum of squared elements, accumulated in f64
    pub fn squared_norm(&self) -> f64 {
        self.shards
            .values()
            .flat_map(|s| s.tensor.data())
            .map(|&v| f64::from(v) * f64::from(v))
            .sum()
    }

    /// Multiply every element by `factor`
    pub fn scale(&mut self, factor: f32) {
        for shard in self.shards.values_mut() {
            for v in shard.tensor.data_mut() {
                *v *= factor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_w() -> BTreeMap<String, Tensor> {
        let mut full = BTreeMap::new();
        full.insert(
            "w".to_string(),
            Tensor::from_vec((1..=8).map(|v| v as f32).collect()),
        );
        full
    }

    #[test]
    fn test_from_full_slices_by_descriptor() {
        let layout = ShardLayout::even(4, [("w", vec![8])]).unwrap();
        for rank in 0..4 {
            let set = ParameterSet::from_full(&layout, rank, &full_w()).unwrap();
            let expected = [(2 * rank + 1) as f32, (2 * rank + 2) as f32];
            assert_eq!(set.get("w").unwrap().tensor.data(), &expected);
            set.check_against(&layout).unwrap();
        }
    }

    #[test]
    fn test_wrong_global_shape_rejected() {
        let layout = ShardLayout::even(2, [("w", vec![2, 4])]).unwrap();
        let result = ParameterSet::from_full(&layout, 0, &full_w());
        assert!(matches!(result, Err(Error::ShardMismatch { .. })));
    }

    #[test]
    fn test_insert_checks_local_shape() {
        let layout = ShardLayout::even(2, [("w", vec![8])]).unwrap();
        let descriptor = layout.descriptor("w", 0).unwrap().clone();
        let mut set = ParameterSet::new(0);
        let result = set.insert(descriptor, Tensor::from_vec(vec![1.0; 3]));
        assert!(matches!(result, Err(Error::ShardMismatch { .. })));
    }

    #[test]
    fn test_clone_does_not_alias() {
        let layout = ShardLayout::even(1, [("w", vec![8])]).unwrap();
        let live = ParameterSet::from_full(&layout, 0, &full_w()).unwrap();
        let mut shadow = live.clone();
        shadow.get_mut("w").unwrap().tensor.data_mut()[0] = 100.0;

        assert_eq!(live.get("w").unwrap().tensor.data()[0], 1.0);
        assert!(!live.bit_eq(&shadow));
    }

    #[test]
    fn test_norm_and_scale() {
        let layout = ShardLayout::even(1, [("w", vec![2])]).unwrap();
        let mut full = BTreeMap::new();
        full.insert("w".to_string(), Tensor::from_vec(vec![3.0, 4.0]));
        let mut set = ParameterSet::from_full(&layout, 0, &full).unwrap();

        assert_eq!(set.squared_norm(), 25.0);
        set.scale(0.5);
        assert_eq!(set.get("w").unwrap().tensor.data(), &[1.5, 2.0]);
    }
}
