//! Collective gather/scatter of sharded parameter sets

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use runtime_core::{Error, Rank, Result, WorkerCoordinatorHandle};

use crate::set::ParameterSet;
use crate::shard::ShardLayout;
use crate::tensor::Tensor;

/// Fully reconstructed tensors keyed by parameter name
pub type FullParameters = BTreeMap<String, Tensor>;

const LEADER: Rank = 0;

/// Raw slices exchanged during gather/scatter
#[derive(Debug, Serialize, Deserialize)]
struct SlicePayload {
    slices: Vec<(String, Vec<f32>)>,
}

/// Per-rank verdict exchanged before any data moves
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Verdict {
    failure: Option<(String, String)>,
}

impl Verdict {
    fn from_result(result: &Result<()>) -> Self {
        let failure = match result {
            Ok(()) => None,
            Err(Error::ShardMismatch { parameter, reason }) => {
                Some((parameter.clone(), reason.clone()))
            }
            Err(other) => Some(("<set>".to_string(), other.to_string())),
        };
        Self { failure }
    }
}

/// Maps logical parameters to per-rank shards and moves them collectively
///
/// `gather` and `scatter` are collective: every rank calls them in the same
/// order. Each first exchanges a verdict so that a mismatch detected on any
/// rank aborts the operation on all ranks before data is moved.
pub struct ShardedParameterStore {
    coordinator: WorkerCoordinatorHandle,
    layout: ShardLayout,
}

impl ShardedParameterStore {
    pub fn new(coordinator: WorkerCoordinatorHandle, layout: ShardLayout) -> Result<Self> {
        if layout.world_size() != coordinator.world_size() {
            return Err(Error::ShardTopology {
                expected_world_size: layout.world_size(),
                actual_world_size: coordinator.world_size(),
            });
        }
        Ok(Self {
            coordinator,
            layout,
        })
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn coordinator(&self) -> &WorkerCoordinatorHandle {
        &self.coordinator
    }

    /// Cut this rank's slices out of full tensors without communicating
    pub fn local_from_full(&self, full: &FullParameters) -> Result<ParameterSet> {
        ParameterSet::from_full(&self.layout, self.coordinator.rank(), full)
    }

    /// Reconstruct full tensors on the leader
    ///
    /// The leader receives `Some`, every other rank `None`. The local set is
    /// only read, never reshaped.
    #[instrument(skip(self, set), fields(rank = self.coordinator.rank()))]
    pub async fn gather(&self, set: &ParameterSet) -> Result<Option<FullParameters>> {
        let local = if set.rank() == self.coordinator.rank() {
            set.check_against(&self.layout)
        } else {
            Err(Error::shard_mismatch(
                "<set>",
                format!(
                    "set belongs to rank {}, caller is rank {}",
                    set.rank(),
                    self.coordinator.rank()
                ),
            ))
        };

        let verdicts: Vec<Verdict> = self
            .coordinator
            .all_gather("gather_check", &Verdict::from_result(&local))
            .await?;
        first_failure(&verdicts)?;

        let payload = SlicePayload {
            slices: set
                .iter()
                .map(|(name, shard)| (name.to_string(), shard.tensor.data().to_vec()))
                .collect(),
        };

        let gathered = self
            .coordinator
            .gather("gather_slices", &payload, LEADER)
            .await?;

        match gathered {
            Some(payloads) => Ok(Some(self.assemble(payloads)?)),
            None => Ok(None),
        }
    }

    /// Hand every rank exactly its slice of the leader's full tensors
    ///
    /// Only the leader's `full` is read; other ranks pass `None`.
    #[instrument(skip(self, full), fields(rank = self.coordinator.rank()))]
    pub async fn scatter(&self, full: Option<&FullParameters>) -> Result<ParameterSet> {
        let rank = self.coordinator.rank();

        let (verdict, per_rank) = if rank == LEADER {
            match full.map(|f| self.split(f)) {
                Some(Ok(per_rank)) => (Verdict { failure: None }, Some(per_rank)),
                Some(Err(e)) => (Verdict::from_result(&Err(e)), None),
                None => (
                    Verdict {
                        failure: Some(("<set>".to_string(), "leader supplied no tensors".to_string())),
                    },
                    None,
                ),
            }
        } else {
            (Verdict { failure: None }, None)
        };

        let verdict: Verdict = self
            .coordinator
            .broadcast("scatter_check", Some(&verdict), LEADER)
            .await?;
        first_failure(std::slice::from_ref(&verdict))?;

        let mine: SlicePayload = self
            .coordinator
            .scatter("scatter_slices", per_rank, LEADER)
            .await?;

        let mut set = ParameterSet::new(rank);
        let mut slices: BTreeMap<String, Vec<f32>> = mine.slices.into_iter().collect();
        for descriptor in self.layout.descriptors_for(rank) {
            let name = &descriptor.parameter_name;
            let data = slices
                .remove(name)
                .ok_or_else(|| Error::shard_mismatch(name, "missing from scattered slices"))?;
            set.insert(
                descriptor.clone(),
                Tensor::new(descriptor.local_shape.clone(), data)?,
            )?;
        }

        debug!(rank = rank, params = set.len(), numel = set.numel(), "Scatter complete");
        Ok(set)
    }

    /// Place every rank's slices by offset; arrival order is irrelevant
    fn assemble(&self, payloads: Vec<SlicePayload>) -> Result<FullParameters> {
        let mut buffers: BTreeMap<String, Vec<f32>> = self
            .layout
            .names()
            .map(|name| {
                let numel = self
                    .layout
                    .global_shape(name)
                    .map(|shape| shape.iter().product())
                    .unwrap_or(0);
                (name.to_string(), vec![0.0; numel])
            })
            .collect();

        for (rank, payload) in payloads.into_iter().enumerate() {
            for (name, data) in payload.slices {
                let descriptor = self.layout.descriptor(&name, rank).ok_or_else(|| {
                    Error::shard_mismatch(&name, format!("unexpected slice from rank {}", rank))
                })?;
                if data.len() != descriptor.local_numel() {
                    return Err(Error::shard_mismatch(
                        &name,
                        format!(
                            "rank {} sent {} elements, descriptor says {}",
                            rank,
                            data.len(),
                            descriptor.local_numel()
                        ),
                    ));
                }
                let buffer = buffers.get_mut(&name).ok_or_else(|| {
                    Error::shard_mismatch(&name, "no buffer for parameter")
                })?;
                buffer[descriptor.range()].copy_from_slice(&data);
            }
        }

        buffers
            .into_iter()
            .map(|(name, data)| {
                let shape = self
                    .layout
                    .global_shape(&name)
                    .map(<[usize]>::to_vec)
                    .unwrap_or_default();
                Tensor::new(shape, data).map(|t| (name, t))
            })
            .collect()
    }

    /// Validate full tensors and cut one payload per rank
    fn split(&self, full: &FullParameters) -> Result<Vec<SlicePayload>> {
        if let Some(extra) = full.keys().find(|name| self.layout.shards(name).is_none()) {
            return Err(Error::shard_mismatch(extra, "not part of the layout"));
        }

        (0..self.layout.world_size())
            .map(|rank| {
                let set = ParameterSet::from_full(&self.layout, rank, full)?;
                Ok(SlicePayload {
                    slices: set
                        .iter()
                        .map(|(name, shard)| (name.to_string(), shard.tensor.data().to_vec()))
                        .collect(),
                })
            })
            .collect()
    }
}

fn first_failure(verdicts: &[Verdict]) -> Result<()> {
    match verdicts.iter().find_map(|v| v.failure.as_ref()) {
        Some((parameter, reason)) => Err(Error::shard_mismatch(parameter, reason)),
        None => Ok(()),
    }
}
