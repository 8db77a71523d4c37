//! Training backends
//!
//! A backend owns exactly two hooks: `boost`, run once before training to
//! prepare parameters and optimizer, and `backward`, run every step to turn
//! this rank's raw gradients into the ones the optimizer consumes. Backends
//! are swapped as values; the loop never branches on which one it holds.

use async_trait::async_trait;
use tracing::{debug, info};

use params::{ParameterSet, ShardDescriptor, ShardLayout};
use runtime_core::{Error, Result, Step, TrainingConfig, WorkerCoordinatorHandle};

use crate::collaborators::Optimizer;

/// What `backward` did to the gradients
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientReport {
    /// L2 norm over every rank's gradients before clipping
    pub global_norm: f64,
    /// Factor the gradients were scaled by, if clipped
    pub clip_scale: Option<f32>,
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare `live` and `optimizer` for training
    async fn boost(&self, live: &ParameterSet, optimizer: &mut dyn Optimizer) -> Result<()>;

    /// Post-process this rank's gradients for `loss`
    async fn backward(
        &self,
        loss: f32,
        grads: &mut ParameterSet,
        global_step: Step,
    ) -> Result<GradientReport>;
}

/// Single-process backend; gradients pass through untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

#[async_trait]
impl TrainingBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn boost(&self, live: &ParameterSet, optimizer: &mut dyn Optimizer) -> Result<()> {
        optimizer.attach(live)
    }

    async fn backward(
        &self,
        loss: f32,
        grads: &mut ParameterSet,
        global_step: Step,
    ) -> Result<GradientReport> {
        if !loss.is_finite() {
            return Err(non_finite("loss", global_step));
        }
        let global_norm = grads.squared_norm().sqrt();
        if !global_norm.is_finite() {
            return Err(non_finite("gradient norm", global_step));
        }
        Ok(GradientReport {
            global_norm,
            clip_scale: None,
        })
    }
}

/// Sharded data-parallel backend
///
/// Every rank holds a slice of each parameter and the gradient for that
/// slice, so the global gradient norm is the square root of the summed
/// per-rank squared norms. Both hooks are collectives.
pub struct DataParallelBackend {
    coordinator: WorkerCoordinatorHandle,
    max_grad_norm: Option<f64>,
}

impl DataParallelBackend {
    pub fn new(coordinator: WorkerCoordinatorHandle, max_grad_norm: Option<f64>) -> Result<Self> {
        if let Some(max) = max_grad_norm {
            if !(max > 0.0 && max.is_finite()) {
                return Err(Error::InvalidConfig {
                    message: format!("max_grad_norm must be positive, got {}", max),
                });
            }
        }
        Ok(Self {
            coordinator,
            max_grad_norm,
        })
    }

    /// Clip at `training.max_grad_norm`, if set
    pub fn from_config(coordinator: WorkerCoordinatorHandle, config: &TrainingConfig) -> Result<Self> {
        Self::new(coordinator, config.max_grad_norm.map(f64::from))
    }
}

#[async_trait]
impl TrainingBackend for DataParallelBackend {
    fn name(&self) -> &'static str {
        "data_parallel"
    }

    /// Check that the ranks' slices tile every parameter exactly
    async fn boost(&self, live: &ParameterSet, optimizer: &mut dyn Optimizer) -> Result<()> {
        let attached = optimizer.attach(live).err().map(|e| e.to_string());
        let claim: (Vec<ShardDescriptor>, Option<String>) = (live.descriptors(), attached);

        let claims = self.coordinator.all_gather("backend_boost", &claim).await?;

        for (rank, (descriptors, attached)) in claims.iter().enumerate() {
            if let Some(reason) = attached {
                return Err(Error::shard_mismatch(
                    "<optimizer>",
                    format!("rank {}: {}", rank, reason),
                ));
            }
            if let Some(foreign) = descriptors.iter().find(|d| d.owner_rank != rank) {
                return Err(Error::shard_mismatch(
                    &foreign.parameter_name,
                    format!(
                        "rank {} holds the slice owned by rank {}",
                        rank, foreign.owner_rank
                    ),
                ));
            }
        }

        let world_size = self.coordinator.world_size();
        let layout = ShardLayout::from_descriptors(
            world_size,
            claims.into_iter().flat_map(|(descriptors, _)| descriptors),
        )?;

        info!(
            rank = self.coordinator.rank(),
            world_size = world_size,
            parameters = layout.len(),
            max_grad_norm = ?self.max_grad_norm,
            "Data-parallel backend ready"
        );
        Ok(())
    }

    async fn backward(
        &self,
        loss: f32,
        grads: &mut ParameterSet,
        global_step: Step,
    ) -> Result<GradientReport> {
        let bad_loss = if loss.is_finite() { 0.0 } else { 1.0 };
        let totals = self
            .coordinator
            .reduce_sum("grad_norm", &[grads.squared_norm(), bad_loss])
            .await?;

        if totals[1] > 0.0 {
            return Err(non_finite("loss", global_step));
        }
        let global_norm = totals[0].sqrt();
        if !global_norm.is_finite() {
            return Err(non_finite("gradient norm", global_step));
        }

        let clip_scale = match self.max_grad_norm {
            Some(max) if global_norm > max => {
                let scale = (max / (global_norm + 1e-6)) as f32;
                grads.scale(scale);
                debug!(global_norm = global_norm, scale = scale, "Gradients clipped");
                Some(scale)
            }
            _ => None,
        };

        Ok(GradientReport {
            global_norm,
            clip_scale,
        })
    }
}

fn non_finite(what: &str, global_step: Step) -> Error {
    Error::NonFinite {
        what: what.to_string(),
        global_step,
    }
}
