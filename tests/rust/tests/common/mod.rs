//! Shared fixtures: a toy model and loader, and helpers to run one
//! `TrainingLoop` per rank.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use checkpoint::CheckpointManager;
use params::{ParameterSet, ShardLayout, ShardedParameterStore, Tensor};
use runtime_core::{
    CheckpointStrategy, Error, LocalProcessGroup, MemorySink, RuntimeConfig, WorkerCoordinator,
    WorkerCoordinatorHandle,
};
use sampler::{BucketConfig, BucketKey, WorkItem};
use trainer::{
    Collaborators, DataLoader, DataParallelBackend, FitSummary, Model, Resume, SgdMomentum,
    TrainingLoop,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub type ToyLoop = TrainingLoop<Quadratic, UnitLoader, SgdMomentum>;

/// Maps every unit to a deterministic scalar target
pub struct UnitLoader;

impl DataLoader for UnitLoader {
    type Batch = Vec<f32>;

    fn load(&mut self, item: &WorkItem) -> runtime_core::Result<Vec<f32>> {
        Ok(item
            .units
            .iter()
            .map(|u| ((u * 37) % 11) as f32 * 0.2 - 1.0)
            .collect())
    }
}

/// `0.5 * sum((p - mean(batch))^2)` over the local slices
pub struct Quadratic;

fn target(batch: &[f32]) -> f32 {
    batch.iter().sum::<f32>() / batch.len() as f32
}

impl Model<Vec<f32>> for Quadratic {
    fn forward(&mut self, params: &ParameterSet, batch: &Vec<f32>) -> runtime_core::Result<f32> {
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
    ) -> runtime_core::Result<()> {
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

pub fn config(dir: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.coordinator.join_timeout = TIMEOUT;
    config.coordinator.collective_timeout = TIMEOUT;
    config.checkpoint.base_path = dir.to_string_lossy().to_string();
    config.checkpoint.strategy = CheckpointStrategy::Steps { interval: 2 };
    config.checkpoint.save_on_epoch_end = true;
    config.checkpoint.keep_count = 50;
    config.ema.decay = 0.95;
    config.ema.warmup_steps = 1;
    config.training.epochs = 3;
    config.training.max_grad_norm = Some(0.5);
    config.perf.warmup_iters = 0;
    config
}

/// Two buckets with different batch sizes; 9 micro-batches per epoch
pub fn buckets() -> Result<BucketConfig> {
    let mut buckets = BucketConfig::new();
    buckets.add_bucket(BucketKey::new("256x256", 1), 2, 0..10)?;
    buckets.add_bucket(BucketKey::new("512x512", 8), 1, 100..104)?;
    Ok(buckets)
}

/// Initial full parameters, sliced evenly over `world_size` ranks
pub fn layout(world_size: usize) -> Result<ShardLayout> {
    Ok(ShardLayout::even(world_size, [("w", vec![12]), ("b", vec![6])])?)
}

fn initial(rank: usize, layout: &ShardLayout) -> Result<ParameterSet> {
    let mut full = BTreeMap::new();
    full.insert(
        "w".to_string(),
        Tensor::from_vec((0..12).map(|i| (i as f32 - 6.0) * 0.3).collect()),
    );
    full.insert("b".to_string(), Tensor::from_vec(vec![0.5; 6]));
    Ok(ParameterSet::from_full(layout, rank, &full)?)
}

/// Build a data-parallel loop for this rank
pub fn build(coordinator: WorkerCoordinatorHandle, config: RuntimeConfig) -> Result<ToyLoop> {
    let layout = layout(coordinator.world_size())?;
    let live = initial(coordinator.rank(), &layout)?;
    let backend = DataParallelBackend::from_config(coordinator.clone(), &config.training)?;
    let store = Arc::new(ShardedParameterStore::new(coordinator, layout)?);
    let checkpoints = CheckpointManager::local(store, config.checkpoint.clone());

    Ok(TrainingLoop::new(
        config,
        checkpoints,
        buckets()?,
        Box::new(backend),
        Collaborators {
            model: Quadratic,
            loader: UnitLoader,
            optimizer: SgdMomentum::new(0.05, 0.9)?,
        },
        live,
        Arc::new(MemorySink::new()),
    )?)
}

/// What one rank ended with
pub struct RankOutcome {
    pub summary: FitSummary,
    pub live: ParameterSet,
    pub shadow: ParameterSet,
    pub steps_per_epoch: u64,
}

pub async fn train(
    coordinator: WorkerCoordinatorHandle,
    config: RuntimeConfig,
    resume: Resume,
    max_steps: Option<u64>,
) -> Result<RankOutcome> {
    let mut training = build(coordinator, config)?;
    training.start(resume).await?;
    let summary = training.fit(max_steps).await?;
    Ok(RankOutcome {
        summary,
        live: training.live().clone(),
        shadow: training.shadow().clone(),
        steps_per_epoch: training.scheduler().steps_per_epoch(),
    })
}

/// Run `f` once per rank of an in-process group; results in rank order
pub async fn run_local_group<F, Fut, T>(world_size: usize, f: F) -> Vec<Result<T>>
where
    F: Fn(WorkerCoordinatorHandle) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handles = Vec::new();
    for member in LocalProcessGroup::new_group(world_size, TIMEOUT) {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let coordinator = WorkerCoordinator::join(Arc::new(member), TIMEOUT).await?;
            f(Arc::new(coordinator)).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        });
    }
    results
}

/// Like [`run_local_group`] but every rank must succeed
pub async fn run_ok<F, Fut, T>(world_size: usize, f: F) -> Result<Vec<T>>
where
    F: Fn(WorkerCoordinatorHandle) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    run_local_group(world_size, f).await.into_iter().collect()
}
