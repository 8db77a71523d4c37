//! The training-loop driver
//!
//! Per step: load the scheduled batch, forward, backward, let the backend
//! post-process gradients, step the optimizer, advance progress, update the
//! shadow set, close the perf iteration and reduce the loss for logging.
//! Checkpoints are taken at the configured cadence and at epoch ends.

use bytes::Bytes;
use tracing::{info, instrument, warn};

use checkpoint::{CheckpointManager, LoadedCheckpoint, SaveOptions};
use params::{EmaTracker, ParameterSet};
use runtime_core::{
    CheckpointId, Error, MetricsSinkHandle, PerfReport, PerformanceInstrumentor, Result,
    RuntimeConfig, TrainingProgress, WorkerCoordinatorHandle,
};
use sampler::{BucketConfig, WorkItem, WorkScheduler};

use crate::backend::TrainingBackend;
use crate::collaborators::{DataLoader, Model, Optimizer};

/// Where training state comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Start from the initial parameters at step 0
    Fresh,
    /// The newest committed checkpoint; fails if there is none
    Latest,
    Checkpoint(CheckpointId),
}

/// The external pieces the loop drives
pub struct Collaborators<M, L, O> {
    pub model: M,
    pub loader: L,
    pub optimizer: O,
}

/// Outcome of one call to [`TrainingLoop::fit`]
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub progress: TrainingProgress,
    /// Steps run by this call
    pub steps_run: u64,
    /// Checkpoints committed by this call
    pub checkpoints: Vec<CheckpointId>,
    /// Whether every configured epoch is done
    pub finished: bool,
    pub perf: Option<PerfReport>,
}

pub struct TrainingLoop<M, L, O> {
    config: RuntimeConfig,
    coordinator: WorkerCoordinatorHandle,
    checkpoints: CheckpointManager,
    scheduler: WorkScheduler,
    backend: Box<dyn TrainingBackend>,
    ema: EmaTracker,
    perf: PerformanceInstrumentor,
    sink: MetricsSinkHandle,
    collaborators: Collaborators<M, L, O>,
    live: ParameterSet,
    shadow: ParameterSet,
    grads: ParameterSet,
    progress: TrainingProgress,
    loss_total: f64,
    loss_count: u64,
    started: bool,
}

impl<M, L, O> TrainingLoop<M, L, O>
where
    L: DataLoader,
    M: Model<L::Batch>,
    O: Optimizer,
{
    /// Wire the loop; `live` holds this rank's initial parameter slices
    pub fn new(
        config: RuntimeConfig,
        checkpoints: CheckpointManager,
        buckets: BucketConfig,
        backend: Box<dyn TrainingBackend>,
        mut collaborators: Collaborators<M, L, O>,
        live: ParameterSet,
        sink: MetricsSinkHandle,
    ) -> Result<Self> {
        config.validate()?;

        let store = checkpoints.store().clone();
        let coordinator = store.coordinator().clone();
        live.check_against(store.layout())?;

        let scheduler = WorkScheduler::new(
            buckets,
            &config.scheduler,
            coordinator.rank(),
            coordinator.world_size(),
        )?;
        let ema = EmaTracker::new(&config.ema)?;
        let perf =
            PerformanceInstrumentor::new(config.perf.clone(), store.layout().total_numel() as u64);

        let mut grads = live.clone();
        collaborators.optimizer.zero_grad(&mut grads);
        let shadow = ema.init_shadow(&live);

        Ok(Self {
            config,
            coordinator,
            checkpoints,
            scheduler,
            backend,
            ema,
            perf,
            sink,
            collaborators,
            live,
            shadow,
            grads,
            progress: TrainingProgress::new(),
            loss_total: 0.0,
            loss_count: 0,
            started: false,
        })
    }

    pub fn progress(&self) -> &TrainingProgress {
        &self.progress
    }

    pub fn live(&self) -> &ParameterSet {
        &self.live
    }

    pub fn shadow(&self) -> &ParameterSet {
        &self.shadow
    }

    pub fn scheduler(&self) -> &WorkScheduler {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn collaborators(&self) -> &Collaborators<M, L, O> {
        &self.collaborators
    }

    /// Establish the starting state on every rank, then boost the backend
    #[instrument(skip(self), fields(rank = self.coordinator.rank(), backend = self.backend.name()))]
    pub async fn start(&mut self, resume: Resume) -> Result<()> {
        self.checkpoints.sweep_staging().await?;

        match resume {
            Resume::Fresh => {
                self.progress = TrainingProgress::new();
                // Warm start: shadow becomes an exact copy of live
                self.ema.update(&mut self.shadow, &self.live, 0.0)?;
                self.scheduler.start_epoch(&self.coordinator, 0).await?;
            }
            Resume::Latest => {
                let loaded = self.checkpoints.load_latest().await?;
                self.restore(loaded).await?;
            }
            Resume::Checkpoint(id) => {
                let loaded = self.checkpoints.load(&id).await?;
                self.restore(loaded).await?;
            }
        }

        self.backend
            .boost(&self.live, &mut self.collaborators.optimizer)
            .await?;
        self.started = true;

        info!(
            rank = self.coordinator.rank(),
            epoch = self.progress.epoch,
            global_step = self.progress.global_step,
            cursor = self.scheduler.cursor(),
            steps_per_epoch = self.scheduler.steps_per_epoch(),
            "Training ready"
        );
        Ok(())
    }

    async fn restore(&mut self, loaded: LoadedCheckpoint) -> Result<()> {
        let id = loaded.metadata.id.clone();
        let state = &loaded.scheduler_state;
        if loaded.progress.epoch != state.epoch
            || loaded.progress.scheduler_cursor != state.per_rank_cursor
        {
            return Err(Error::CheckpointLoad {
                checkpoint_id: id,
                reason: format!(
                    "progress at epoch {} cursor {} disagrees with scheduler state at epoch {} cursor {}",
                    loaded.progress.epoch,
                    loaded.progress.scheduler_cursor,
                    state.epoch,
                    state.per_rank_cursor
                ),
            });
        }

        let restored = self
            .collaborators
            .optimizer
            .load_state(&loaded.optimizer_state)
            .err()
            .map(|e| e.to_string());
        let statuses: Vec<Option<String>> = self
            .coordinator
            .all_gather("optimizer_restore", &restored)
            .await?;
        if let Some((rank, reason)) = statuses
            .iter()
            .enumerate()
            .find_map(|(rank, s)| s.as_ref().map(|reason| (rank, reason)))
        {
            return Err(Error::CheckpointLoad {
                checkpoint_id: id,
                reason: format!("optimizer state on rank {}: {}", rank, reason),
            });
        }

        self.scheduler
            .restore(&self.coordinator, &loaded.scheduler_state)
            .await?;

        self.progress = loaded.progress;
        self.live = loaded.live;
        self.shadow = loaded.shadow;
        self.grads = self.live.clone();
        self.collaborators.optimizer.zero_grad(&mut self.grads);

        info!(
            rank = self.coordinator.rank(),
            checkpoint_id = %id,
            global_step = self.progress.global_step,
            "Resumed from checkpoint"
        );
        Ok(())
    }

    /// Train until every epoch is done or `max_steps` steps ran in this call
    pub async fn fit(&mut self, max_steps: Option<u64>) -> Result<FitSummary> {
        if !self.started {
            return Err(Error::Internal {
                message: "fit called before start".to_string(),
            });
        }

        let epochs = self.config.training.epochs;
        let mut steps_run = 0;
        let mut saved = Vec::new();
        self.perf.on_fit_start();

        while self.progress.epoch < epochs {
            if max_steps.is_some_and(|max| steps_run >= max) {
                break;
            }

            let Some(item) = self.scheduler.advance() else {
                let next = self.progress.epoch + 1;
                self.progress.begin_epoch(next);
                if next < epochs {
                    self.scheduler.start_epoch(&self.coordinator, next).await?;
                }
                continue;
            };

            self.train_step(&item).await?;
            steps_run += 1;

            if let Some(id) = self.maybe_save().await? {
                saved.push(id);
            }
        }

        let finished = self.progress.epoch >= epochs;
        let perf = self
            .perf
            .on_fit_end(self.sink.as_ref(), self.progress.global_step);

        info!(
            rank = self.coordinator.rank(),
            global_step = self.progress.global_step,
            steps_run = steps_run,
            checkpoints = saved.len(),
            finished = finished,
            "Fit finished"
        );

        Ok(FitSummary {
            progress: self.progress,
            steps_run,
            checkpoints: saved,
            finished,
            perf,
        })
    }

    async fn train_step(&mut self, item: &WorkItem) -> Result<()> {
        self.perf.start_new_iter();

        self.perf.before_encode()?;
        let batch = self.collaborators.loader.load(item)?;

        self.perf.before_forward()?;
        let loss = self.collaborators.model.forward(&self.live, &batch)?;

        self.perf.before_backward()?;
        self.collaborators.optimizer.zero_grad(&mut self.grads);
        self.collaborators
            .model
            .backward(&self.live, &batch, &mut self.grads)?;
        drop(batch);
        let report = self
            .backend
            .backward(loss, &mut self.grads, self.progress.global_step + 1)
            .await?;

        self.perf.before_optimizer_update()?;
        self.collaborators
            .optimizer
            .step(&mut self.live, &self.grads)?;

        self.progress.complete_step(self.scheduler.cursor());
        let decay = self.ema.decay_for_step(self.progress.global_step);
        self.ema.update(&mut self.shadow, &self.live, decay)?;

        self.perf.end_iter(item.units.len() as u64)?;

        // Averaged for reporting only; each rank steps on its own loss
        let mean_loss = self
            .coordinator
            .reduce_mean("loss", f64::from(loss))
            .await?;
        self.loss_total += mean_loss;
        self.loss_count += 1;

        let step = self.progress.global_step;
        if self.coordinator.is_leader() && step % self.config.training.log_every == 0 {
            let running = self.loss_total / self.loss_count as f64;
            self.sink.record_scalar("train/loss", mean_loss, step);
            self.sink.record_scalar("train/loss_avg", running, step);
            self.sink
                .record_scalar("train/grad_norm", report.global_norm, step);
            self.sink
                .record_scalar("train/ema_decay", f64::from(decay), step);
            info!(
                epoch = self.progress.epoch,
                global_step = step,
                loss = mean_loss,
                loss_avg = running,
                grad_norm = report.global_norm,
                clipped = report.clip_scale.is_some(),
                "Step"
            );
        }
        Ok(())
    }

    /// Save if the cadence, an epoch end or the final step calls for it
    ///
    /// A failed write leaves the previous checkpoint in place; training goes
    /// on and the next due save tries again.
    async fn maybe_save(&mut self) -> Result<Option<CheckpointId>> {
        let config = &self.config.checkpoint;
        let end_of_epoch = self.scheduler.is_epoch_done();
        let final_step = end_of_epoch && self.progress.epoch + 1 >= self.config.training.epochs;
        let consolidate_live = final_step && config.consolidate_live_on_final;

        let due = config.strategy.is_due(self.progress.global_step)
            || (end_of_epoch && config.save_on_epoch_end)
            || consolidate_live;
        if !due {
            return Ok(None);
        }

        let optimizer_state: Bytes = self.collaborators.optimizer.state()?;
        let saved = self
            .checkpoints
            .save(
                &self.progress,
                &self.live,
                &self.shadow,
                optimizer_state,
                &self.scheduler.state(),
                SaveOptions { consolidate_live },
            )
            .await;

        match saved {
            Ok(metadata) => Ok(Some(metadata.id)),
            Err(e) if e.is_retryable() => {
                warn!(
                    rank = self.coordinator.rank(),
                    global_step = self.progress.global_step,
                    error = %e,
                    "Checkpoint save failed, keeping the previous checkpoint"
                );
                if self.coordinator.is_leader() {
                    self.sink
                        .record_scalar("checkpoint/save_failed", 1.0, self.progress.global_step);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::optimizer::SgdMomentum;
    use params::{ShardLayout, ShardedParameterStore, Tensor};
    use runtime_core::{
        CheckpointStrategy, LocalProcessGroup, MemorySink, WorkerCoordinator,
    };
    use sampler::BucketKey;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    struct UnitLoader;

    impl DataLoader for UnitLoader {
        type Batch = Vec<f32>;

        fn load(&mut self, item: &WorkItem) -> Result<Vec<f32>> {
            Ok(item.units.iter().map(|u| (u % 7) as f32 * 0.25).collect())
        }
    }

    /// Pulls every element toward the batch mean
    struct Quadratic;

    fn target(batch: &[f32]) -> f32 {
        batch.iter().sum::<f32>() / batch.len() as f32
    }

    impl Model<Vec<f32>> for Quadratic {
        fn forward(&mut self, params: &ParameterSet, batch: &Vec<f32>) -> Result<f32> {
            let t = target(batch);
            Ok(params
                .iter()
                .flat_map(|(_, shard)| shard.tensor.data())
                .map(|p| 0.5 * (p - t).powi(2))
                .sum())
        }

        fn backward(
            &mut self,
            params: &ParameterSet,
            batch: &Vec<f32>,
            grads: &mut ParameterSet,
        ) -> Result<()> {
            let t = target(batch);
            for (name, shard) in params.iter() {
                let grad = grads
                    .get_mut(name)
                    .ok_or_else(|| Error::shard_mismatch(name, "no gradient"))?;
                for (g, p) in grad.tensor.data_mut().iter_mut().zip(shard.tensor.data()) {
                    *g += p - t;
                }
            }
            Ok(())
        }
    }

    type ToyLoop = TrainingLoop<Quadratic, UnitLoader, SgdMomentum>;

    fn config(dir: &Path) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.checkpoint.base_path = dir.to_string_lossy().to_string();
        config.checkpoint.strategy = CheckpointStrategy::Steps { interval: 3 };
        config.checkpoint.save_on_epoch_end = true;
        config.checkpoint.keep_count = 10;
        config.ema.decay = 0.9;
        config.ema.warmup_steps = 2;
        config.training.epochs = 2;
        config.perf.warmup_iters = 0;
        config
    }

    async fn build(config: RuntimeConfig, sink: Arc<MemorySink>) -> ToyLoop {
        let member = LocalProcessGroup::new_group(1, Duration::from_secs(5)).remove(0);
        let coordinator = Arc::new(
            WorkerCoordinator::join(Arc::new(member), Duration::from_secs(5))
                .await
                .unwrap(),
        );

        let layout = ShardLayout::even(1, [("w", vec![4]), ("b", vec![1])]).unwrap();
        let mut full = BTreeMap::new();
        full.insert(
            "w".to_string(),
            Tensor::from_vec(vec![1.0, -1.0, 0.5, 2.0]),
        );
        full.insert("b".to_string(), Tensor::from_vec(vec![0.0]));
        let live = ParameterSet::from_full(&layout, 0, &full).unwrap();

        let store = Arc::new(ShardedParameterStore::new(coordinator, layout).unwrap());
        let checkpoints = CheckpointManager::local(store, config.checkpoint.clone());

        // 8 units in batches of 2: 4 steps per epoch
        let mut buckets = BucketConfig::new();
        buckets
            .add_bucket(BucketKey::new("64x64", 1), 2, 0..8)
            .unwrap();

        TrainingLoop::new(
            config,
            checkpoints,
            buckets,
            Box::new(LocalBackend),
            Collaborators {
                model: Quadratic,
                loader: UnitLoader,
                optimizer: SgdMomentum::new(0.1, 0.9).unwrap(),
            },
            live,
            sink,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_run_saves_on_cadence_and_epoch_end() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let mut training = build(config(dir.path()), sink.clone()).await;

        training.start(Resume::Fresh).await.unwrap();
        let summary = training.fit(None).await.unwrap();

        assert!(summary.finished);
        assert_eq!(summary.steps_run, 8);
        assert_eq!(summary.progress.global_step, 8);
        assert_eq!(
            summary.checkpoints,
            vec![
                "epoch0-global_step3",
                "epoch0-global_step4",
                "epoch1-global_step6",
                "epoch1-global_step8",
            ]
        );
        assert_eq!(sink.series("train/loss").len(), 8);
        assert!(summary.perf.is_some());
        assert!(!sink.series("perf/units_per_sec").is_empty());

        // Warm-up steps use decay 0
        let decays = sink.series("train/ema_decay");
        assert_eq!(decays[0].1, 0.0);
        assert!((decays[7].1 - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let reference_dir = tempdir().unwrap();
        let mut reference = build(
            config(reference_dir.path()),
            Arc::new(MemorySink::new()),
        )
        .await;
        reference.start(Resume::Fresh).await.unwrap();
        reference.fit(None).await.unwrap();

        // Crash after 5 steps; the newest checkpoint is at step 4
        let dir = tempdir().unwrap();
        let mut interrupted = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        interrupted.start(Resume::Fresh).await.unwrap();
        let partial = interrupted.fit(Some(5)).await.unwrap();
        assert!(!partial.finished);
        assert_eq!(partial.progress.global_step, 5);
        drop(interrupted);

        let mut resumed = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        resumed.start(Resume::Latest).await.unwrap();
        assert_eq!(resumed.progress().global_step, 4);
        let summary = resumed.fit(None).await.unwrap();

        assert_eq!(summary.steps_run, 4);
        assert_eq!(summary.progress, *reference.progress());
        assert!(resumed.live().bit_eq(reference.live()));
        assert!(resumed.shadow().bit_eq(reference.shadow()));
    }

    #[tokio::test]
    async fn test_mid_epoch_resume_matches_uninterrupted_run() {
        let reference_dir = tempdir().unwrap();
        let mut reference = build(
            config(reference_dir.path()),
            Arc::new(MemorySink::new()),
        )
        .await;
        reference.start(Resume::Fresh).await.unwrap();
        reference.fit(None).await.unwrap();

        let dir = tempdir().unwrap();
        let mut interrupted = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        interrupted.start(Resume::Fresh).await.unwrap();
        interrupted.fit(Some(3)).await.unwrap();
        drop(interrupted);

        let mut resumed = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        resumed
            .start(Resume::Checkpoint("epoch0-global_step3".to_string()))
            .await
            .unwrap();
        assert_eq!(resumed.scheduler().cursor(), 3);
        resumed.fit(None).await.unwrap();

        assert_eq!(resumed.progress(), reference.progress());
        assert!(resumed.live().bit_eq(reference.live()));
        assert!(resumed.shadow().bit_eq(reference.shadow()));
    }

    #[tokio::test]
    async fn test_resume_latest_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let mut training = build(config(dir.path()), Arc::new(MemorySink::new())).await;

        let result = training.start(Resume::Latest).await;
        assert!(matches!(result, Err(Error::CheckpointLoad { .. })));
        assert!(training.fit(None).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_run_resumes_as_finished() {
        let dir = tempdir().unwrap();
        let mut training = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        training.start(Resume::Fresh).await.unwrap();
        training.fit(None).await.unwrap();
        drop(training);

        let mut again = build(config(dir.path()), Arc::new(MemorySink::new())).await;
        again.start(Resume::Latest).await.unwrap();
        let summary = again.fit(None).await.unwrap();
        assert!(summary.finished);
        assert_eq!(summary.steps_run, 0);
        assert_eq!(summary.progress.global_step, 8);
    }

    #[tokio::test]
    async fn test_shadow_equals_live_during_warmup() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.ema.warmup_steps = 1_000;
        config.checkpoint.strategy = CheckpointStrategy::Manual;
        config.checkpoint.save_on_epoch_end = false;
        config.checkpoint.consolidate_live_on_final = true;

        let mut training = build(config, Arc::new(MemorySink::new())).await;
        training.start(Resume::Fresh).await.unwrap();
        let summary = training.fit(None).await.unwrap();

        assert!(training.shadow().bit_eq(training.live()));
        // Only the final save, with consolidated live tensors
        assert_eq!(summary.checkpoints, vec!["epoch1-global_step8"]);
        let list = training.checkpoints().list().await.unwrap();
        assert!(list[0].live_consolidated);
    }
}
