//! Checkpoint manager for coordinating distributed checkpoints
//!
//! Save and load are collective: every rank calls them at the same global
//! step. Each phase ends with an exchange of per-rank statuses so that a
//! failure on any rank is seen by all of them before anything becomes
//! visible on disk.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use params::{FullParameters, ParameterSet, ShardedParameterStore, Tensor};
use runtime_core::{
    CheckpointConfig, CheckpointId, CheckpointMetadata, Error, Rank, Result, TrainingProgress,
    WorkerCoordinatorHandle,
};
use sampler::SchedulerState;
use storage::{LocalStorage, StorageHandle};

use crate::format::{
    decode_tensor, encode_tensor, rank_file, staging_dir, tensor_file, ParamLayout,
    ParamManifest, ProgressFile, RankShardFile, FORMAT_VERSION, LIVE_DIR, MANIFEST_FILE,
    OPTIMIZER_DIR, PROGRESS_FILE, SCHEDULER_FILE, SHADOW_DIR, STAGING_PREFIX,
};
use crate::writer::CheckpointWriter;

const LEADER: Rank = 0;

/// Options for a single save
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Also write full live tensors under `live_params/full/`
    pub consolidate_live: bool,
}

/// Where a checkpoint id stands on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Absent,
    /// Only a staging directory exists
    Writing,
    Committed,
}

/// Everything restored by a load
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub metadata: CheckpointMetadata,
    pub progress: TrainingProgress,
    pub scheduler_state: SchedulerState,
    pub live: ParameterSet,
    pub shadow: ParameterSet,
    pub optimizer_state: Bytes,
}

/// What each rank claims before a save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SaveClaim {
    progress: TrainingProgress,
    scheduler_seed: u64,
    scheduler_epoch: u64,
    consolidate_live: bool,
    live_failure: Option<(String, String)>,
}

/// Per-rank outcome of the local part of a load
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LoadVerdict {
    Ready,
    Topology { expected: usize, actual: usize },
    Failed(String),
}

/// This rank's share of a checkpoint, read before any data moves
struct LocalLoad {
    progress: ProgressFile,
    scheduler_state: SchedulerState,
    live: ParameterSet,
    optimizer_state: Bytes,
    shadow_full: Option<FullParameters>,
}

/// Checkpoint manager for atomically committed, sharded checkpoints
///
/// Holds no state between calls beyond its configuration; everything it
/// knows about existing checkpoints is read back from storage.
pub struct CheckpointManager {
    storage: StorageHandle,
    store: Arc<ShardedParameterStore>,
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(
        storage: StorageHandle,
        store: Arc<ShardedParameterStore>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            storage,
            store,
            config,
        }
    }

    /// Manager over local storage rooted at `config.base_path`
    pub fn local(store: Arc<ShardedParameterStore>, config: CheckpointConfig) -> Self {
        let storage: StorageHandle = Arc::new(LocalStorage::new(&config.base_path));
        Self::new(storage, store, config)
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ShardedParameterStore> {
        &self.store
    }

    fn coordinator(&self) -> &WorkerCoordinatorHandle {
        self.store.coordinator()
    }

    fn rank(&self) -> Rank {
        self.coordinator().rank()
    }

    fn is_leader(&self) -> bool {
        self.rank() == LEADER
    }

    /// Persist the full training state under `progress.checkpoint_id()`
    ///
    /// On error nothing new is visible and the previously committed
    /// checkpoint, if any, is untouched.
    #[instrument(skip_all, fields(rank = self.rank(), global_step = progress.global_step))]
    pub async fn save(
        &self,
        progress: &TrainingProgress,
        live: &ParameterSet,
        shadow: &ParameterSet,
        optimizer_state: Bytes,
        scheduler_state: &SchedulerState,
        options: SaveOptions,
    ) -> Result<CheckpointMetadata> {
        let id = progress.checkpoint_id();
        let coordinator = self.coordinator().clone();

        self.check_save_agreement(progress, live, scheduler_state, options)
            .await?;

        let prepared = if self.is_leader() {
            Some(self.prepare_target(&id).await)
        } else {
            None
        };
        let prepared: Option<String> = coordinator
            .broadcast("checkpoint_prepare", prepared.as_ref(), LEADER)
            .await?;
        if let Some(reason) = prepared {
            return Err(Error::CheckpointWrite {
                checkpoint_id: id,
                reason,
            });
        }

        let shadow_full = self.store.gather(shadow).await?;
        let live_full = if options.consolidate_live {
            self.store.gather(live).await?
        } else {
            None
        };

        let mut writer = CheckpointWriter::new(self.storage.clone(), id.clone());
        let staged = self
            .stage(
                &mut writer,
                live,
                optimizer_state,
                scheduler_state,
                shadow_full.as_ref(),
                live_full.as_ref(),
            )
            .await;
        let status = staged.err().map(|e| e.to_string());
        let statuses: Vec<Option<String>> =
            coordinator.all_gather("checkpoint_staged", &status).await?;

        if let Some((rank, reason)) = first_failure(&statuses) {
            if self.is_leader() {
                CheckpointWriter::abort(&self.storage, &id).await;
            }
            warn!(checkpoint_id = %id, failed_rank = rank, reason = %reason, "Checkpoint save abandoned");
            return Err(Error::CheckpointWrite {
                checkpoint_id: id,
                reason: format!("rank {}: {}", rank, reason),
            });
        }

        let committed = if self.is_leader() {
            let file = ProgressFile {
                format_version: FORMAT_VERSION,
                checkpoint_id: id.clone(),
                progress: *progress,
                world_size: coordinator.world_size(),
                created_at: Utc::now(),
                live_consolidated: options.consolidate_live,
            };
            let outcome = match commit(writer, &file).await {
                Ok(()) => Ok(file),
                Err(e) => {
                    CheckpointWriter::abort(&self.storage, &id).await;
                    Err(e.to_string())
                }
            };
            Some(outcome)
        } else {
            None
        };
        let committed: std::result::Result<ProgressFile, String> = coordinator
            .broadcast("checkpoint_commit", committed.as_ref(), LEADER)
            .await?;

        let file = committed.map_err(|reason| {
            warn!(checkpoint_id = %id, reason = %reason, "Checkpoint commit failed");
            Error::CheckpointWrite {
                checkpoint_id: id.clone(),
                reason,
            }
        })?;

        if self.is_leader() {
            info!(
                checkpoint_id = %id,
                epoch = progress.epoch,
                global_step = progress.global_step,
                "Checkpoint committed"
            );
            self.apply_retention(&id).await;
        }

        Ok(file.metadata())
    }

    /// Restore a committed checkpoint on every rank
    ///
    /// Requires the current world size to match the one recorded at save.
    #[instrument(skip(self), fields(rank = self.rank()))]
    pub async fn load(&self, checkpoint_id: &str) -> Result<LoadedCheckpoint> {
        let local = self.read_local(checkpoint_id).await;
        let verdict = match &local {
            Ok(_) => LoadVerdict::Ready,
            Err(Error::ShardTopology {
                expected_world_size,
                actual_world_size,
            }) => LoadVerdict::Topology {
                expected: *expected_world_size,
                actual: *actual_world_size,
            },
            Err(e) => LoadVerdict::Failed(e.to_string()),
        };

        let verdicts: Vec<LoadVerdict> = self
            .coordinator()
            .all_gather("checkpoint_load_check", &verdict)
            .await?;
        for (rank, verdict) in verdicts.iter().enumerate() {
            match verdict {
                LoadVerdict::Ready => {}
                LoadVerdict::Topology { expected, actual } => {
                    return Err(Error::ShardTopology {
                        expected_world_size: *expected,
                        actual_world_size: *actual,
                    });
                }
                LoadVerdict::Failed(reason) => {
                    return Err(Error::CheckpointLoad {
                        checkpoint_id: checkpoint_id.to_string(),
                        reason: format!("rank {}: {}", rank, reason),
                    });
                }
            }
        }
        let local = local?;

        let shadow = self.store.scatter(local.shadow_full.as_ref()).await?;

        info!(
            checkpoint_id = %checkpoint_id,
            global_step = local.progress.progress.global_step,
            cursor = local.scheduler_state.per_rank_cursor,
            "Checkpoint loaded"
        );

        Ok(LoadedCheckpoint {
            metadata: local.progress.metadata(),
            progress: local.progress.progress,
            scheduler_state: local.scheduler_state,
            live: local.live,
            shadow,
            optimizer_state: local.optimizer_state,
        })
    }

    /// Load the newest committed checkpoint
    ///
    /// The leader picks it so every rank loads the same one. Fails with
    /// `CheckpointLoad` when none exists.
    pub async fn load_latest(&self) -> Result<LoadedCheckpoint> {
        let choice = if self.is_leader() {
            Some(
                self.latest()
                    .await
                    .map(|latest| latest.map(|m| m.id))
                    .map_err(|e| e.to_string()),
            )
        } else {
            None
        };
        let choice: std::result::Result<Option<CheckpointId>, String> = self
            .coordinator()
            .broadcast("checkpoint_latest", choice.as_ref(), LEADER)
            .await?;

        match choice {
            Ok(Some(id)) => self.load(&id).await,
            Ok(None) => Err(Error::CheckpointLoad {
                checkpoint_id: "latest".to_string(),
                reason: "no committed checkpoint found".to_string(),
            }),
            Err(reason) => Err(Error::CheckpointLoad {
                checkpoint_id: "latest".to_string(),
                reason,
            }),
        }
    }

    /// Committed checkpoints ordered by global step
    pub async fn list(&self) -> Result<Vec<CheckpointMetadata>> {
        let mut checkpoints = Vec::new();
        for name in self.storage.list_dirs("").await? {
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            match self.read_progress(&name).await {
                Ok(file) => checkpoints.push(file.metadata()),
                Err(Error::StoragePathNotFound { .. }) => {
                    debug!(dir = %name, "Skipping directory without progress file");
                }
                Err(e) => {
                    warn!(dir = %name, error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| {
            a.progress
                .global_step
                .cmp(&b.progress.global_step)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(checkpoints)
    }

    /// The committed checkpoint with the highest global step
    pub async fn latest(&self) -> Result<Option<CheckpointMetadata>> {
        Ok(self.list().await?.pop())
    }

    pub async fn state_of(&self, checkpoint_id: &str) -> Result<CheckpointState> {
        if self
            .storage
            .exists(&format!("{}/{}", checkpoint_id, PROGRESS_FILE))
            .await?
        {
            Ok(CheckpointState::Committed)
        } else if self.storage.exists(&staging_dir(checkpoint_id)).await? {
            Ok(CheckpointState::Writing)
        } else {
            Ok(CheckpointState::Absent)
        }
    }

    /// Remove staging directories left behind by interrupted saves
    ///
    /// Runs on the leader only; must not overlap a save.
    pub async fn sweep_staging(&self) -> Result<usize> {
        if !self.is_leader() {
            return Ok(0);
        }
        let mut removed = 0;
        for name in self.storage.list_dirs("").await? {
            if name.starts_with(STAGING_PREFIX) {
                self.storage.delete_dir(&name).await?;
                info!(dir = %name, "Removed stale checkpoint staging");
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn check_save_agreement(
        &self,
        progress: &TrainingProgress,
        live: &ParameterSet,
        scheduler_state: &SchedulerState,
        options: SaveOptions,
    ) -> Result<()> {
        let live_failure = match live.check_against(self.store.layout()) {
            Ok(()) => None,
            Err(Error::ShardMismatch { parameter, reason }) => Some((parameter, reason)),
            Err(e) => Some(("<set>".to_string(), e.to_string())),
        };
        let claim = SaveClaim {
            progress: *progress,
            scheduler_seed: scheduler_state.base_seed,
            scheduler_epoch: scheduler_state.epoch,
            consolidate_live: options.consolidate_live,
            live_failure,
        };
        let claims: Vec<SaveClaim> = self
            .coordinator()
            .all_gather("checkpoint_save_check", &claim)
            .await?;

        if let Some((parameter, reason)) = claims.iter().find_map(|c| c.live_failure.clone()) {
            return Err(Error::ShardMismatch { parameter, reason });
        }

        let expected = &claims[0];
        for (rank, actual) in claims.iter().enumerate() {
            if actual.progress != expected.progress
                || actual.consolidate_live != expected.consolidate_live
            {
                return Err(Error::coordination(
                    "checkpoint_save",
                    format!(
                        "rank {} is at global_step {} (epoch {}), rank 0 at global_step {} (epoch {})",
                        rank,
                        actual.progress.global_step,
                        actual.progress.epoch,
                        expected.progress.global_step,
                        expected.progress.epoch
                    ),
                ));
            }
            if actual.scheduler_seed != expected.scheduler_seed
                || actual.scheduler_epoch != expected.scheduler_epoch
            {
                return Err(Error::SchedulerDesync {
                    rank,
                    expected_seed: expected.scheduler_seed,
                    actual_seed: actual.scheduler_seed,
                    expected_epoch: expected.scheduler_epoch,
                    actual_epoch: actual.scheduler_epoch,
                });
            }
        }
        Ok(())
    }

    /// Leader-side check that `id` can be written; returns a failure reason
    async fn prepare_target(&self, id: &str) -> Option<String> {
        match self.state_of(id).await {
            Ok(CheckpointState::Absent) => None,
            Ok(CheckpointState::Committed) => Some("checkpoint already committed".to_string()),
            Ok(CheckpointState::Writing) => {
                warn!(checkpoint_id = %id, "Discarding stale staging from an earlier attempt");
                match self.storage.delete_dir(&staging_dir(id)).await {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                }
            }
            Err(e) => Some(e.to_string()),
        }
    }

    async fn stage(
        &self,
        writer: &mut CheckpointWriter,
        live: &ParameterSet,
        optimizer_state: Bytes,
        scheduler_state: &SchedulerState,
        shadow_full: Option<&FullParameters>,
        live_full: Option<&FullParameters>,
    ) -> Result<()> {
        let rank = self.rank();
        writer
            .put(
                &format!("{}/{}", LIVE_DIR, rank_file(rank)),
                RankShardFile::encode(rank, live)?,
            )
            .await?;
        writer
            .put(&format!("{}/{}", OPTIMIZER_DIR, rank_file(rank)), optimizer_state)
            .await?;

        if !self.is_leader() {
            return Ok(());
        }

        let layout = self.store.layout();
        let shadow_full = shadow_full.ok_or_else(|| Error::Internal {
            message: "leader received no gathered shadow parameters".to_string(),
        })?;
        let shadow_files = write_gathered(writer, SHADOW_DIR, "", shadow_full).await?;
        writer
            .put_json(
                &format!("{}/{}", SHADOW_DIR, MANIFEST_FILE),
                &ParamManifest {
                    format_version: FORMAT_VERSION,
                    layout: ParamLayout::Gathered,
                    world_size: layout.world_size(),
                    descriptors: layout.all_descriptors(),
                    files: shadow_files,
                },
            )
            .await?;

        let live_files = match live_full {
            Some(full) => write_gathered(writer, LIVE_DIR, "full/", full).await?,
            None => Vec::new(),
        };
        writer
            .put_json(
                &format!("{}/{}", LIVE_DIR, MANIFEST_FILE),
                &ParamManifest {
                    format_version: FORMAT_VERSION,
                    layout: ParamLayout::Sharded,
                    world_size: layout.world_size(),
                    descriptors: layout.all_descriptors(),
                    files: live_files,
                },
            )
            .await?;

        writer
            .put(SCHEDULER_FILE, Bytes::from(scheduler_state.to_bytes()?))
            .await?;
        Ok(())
    }

    async fn read_local(&self, id: &str) -> Result<LocalLoad> {
        let world_size = self.coordinator().world_size();
        let layout = self.store.layout();

        let progress = self.read_progress(id).await.map_err(|e| match e {
            Error::StoragePathNotFound { .. } => Error::CheckpointLoad {
                checkpoint_id: id.to_string(),
                reason: "no committed checkpoint with this id".to_string(),
            },
            other => other,
        })?;
        if progress.checkpoint_id != id {
            return Err(load_error(
                id,
                format!("progress file names checkpoint {}", progress.checkpoint_id),
            ));
        }
        if progress.world_size != world_size {
            return Err(Error::ShardTopology {
                expected_world_size: progress.world_size,
                actual_world_size: world_size,
            });
        }

        let scheduler_state =
            SchedulerState::from_bytes(&self.read_artifact(id, SCHEDULER_FILE).await?)?;

        let manifest: ParamManifest = self
            .read_json(id, &format!("{}/{}", LIVE_DIR, MANIFEST_FILE))
            .await?;
        if manifest.world_size != world_size {
            return Err(Error::ShardTopology {
                expected_world_size: manifest.world_size,
                actual_world_size: world_size,
            });
        }
        if manifest.descriptors != layout.all_descriptors() {
            return Err(load_error(
                id,
                "saved shard descriptors differ from the current layout",
            ));
        }

        let rank = self.rank();
        let shard_file = RankShardFile::decode(
            &self
                .read_artifact(id, &format!("{}/{}", LIVE_DIR, rank_file(rank)))
                .await?,
        )?;
        if shard_file.rank != rank || shard_file.set.rank() != rank {
            return Err(load_error(
                id,
                format!("shard file for rank {} holds rank {}", rank, shard_file.rank),
            ));
        }
        shard_file.set.check_against(layout)?;

        let optimizer_state = self
            .read_artifact(id, &format!("{}/{}", OPTIMIZER_DIR, rank_file(rank)))
            .await?;

        let shadow_full = if self.is_leader() {
            Some(self.read_gathered(id, SHADOW_DIR).await?)
        } else {
            None
        };

        Ok(LocalLoad {
            progress,
            scheduler_state,
            live: shard_file.set,
            optimizer_state,
            shadow_full,
        })
    }

    async fn read_gathered(&self, id: &str, dir: &str) -> Result<FullParameters> {
        let manifest: ParamManifest = self
            .read_json(id, &format!("{}/{}", dir, MANIFEST_FILE))
            .await?;
        if manifest.layout != ParamLayout::Gathered {
            return Err(load_error(id, format!("{} is not a gathered layout", dir)));
        }

        let layout = self.store.layout();
        if manifest.world_size != layout.world_size() {
            return Err(Error::ShardTopology {
                expected_world_size: manifest.world_size,
                actual_world_size: layout.world_size(),
            });
        }
        if manifest.descriptors != layout.all_descriptors() {
            return Err(load_error(
                id,
                format!("{} descriptors differ from the current layout", dir),
            ));
        }

        let listed: BTreeSet<&str> = manifest.files.iter().map(|(name, _)| name.as_str()).collect();
        if listed.len() != manifest.files.len() {
            return Err(load_error(id, format!("{} lists a parameter twice", dir)));
        }
        if let Some(missing) = layout.names().find(|name| !listed.contains(name)) {
            return Err(load_error(id, format!("{} has no file for {}", dir, missing)));
        }

        let mut full = FullParameters::new();
        for (name, file) in &manifest.files {
            let expected_shape = layout.global_shape(name).ok_or_else(|| {
                load_error(id, format!("{} holds {}, which is not in the layout", dir, name))
            })?;
            let bytes = self
                .read_artifact(id, &format!("{}/{}", dir, file))
                .await?;
            let tensor: Tensor = decode_tensor(&bytes)
                .map_err(|e| load_error(id, format!("{}/{}: {}", dir, file, e)))?;
            if tensor.shape() != expected_shape {
                return Err(load_error(
                    id,
                    format!(
                        "{}/{} has shape {:?}, layout expects {:?}",
                        dir,
                        file,
                        tensor.shape(),
                        expected_shape
                    ),
                ));
            }
            full.insert(name.clone(), tensor);
        }
        Ok(full)
    }

    async fn read_progress(&self, id: &str) -> Result<ProgressFile> {
        let file: ProgressFile = self.read_json(id, PROGRESS_FILE).await?;
        if file.format_version != FORMAT_VERSION {
            return Err(load_error(
                id,
                format!("unsupported format version {}", file.format_version),
            ));
        }
        Ok(file)
    }

    async fn read_artifact(&self, id: &str, path: &str) -> Result<Bytes> {
        self.storage
            .read(&format!("{}/{}", id, path))
            .await
    }

    async fn read_json<T: DeserializeOwned>(&self, id: &str, path: &str) -> Result<T> {
        let bytes = self.read_artifact(id, path).await?;
        serde_json::from_slice(&bytes).map_err(|e| load_error(id, format!("{}: {}", path, e)))
    }

    /// Delete the oldest committed checkpoints beyond `keep_count`
    async fn apply_retention(&self, keep: &str) {
        let committed = match self.list().await {
            Ok(committed) => committed,
            Err(e) => {
                warn!(error = %e, "Failed to list checkpoints for retention");
                return;
            }
        };

        let excess = committed.len().saturating_sub(self.config.keep_count);
        for meta in committed.iter().take(excess).filter(|m| m.id != keep) {
            // Drop the progress file first so a half-deleted directory is never listed
            let result = match self
                .storage
                .delete(&format!("{}/{}", meta.id, PROGRESS_FILE))
                .await
            {
                Ok(()) => self.storage.delete_dir(&meta.id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(checkpoint_id = %meta.id, "Deleted old checkpoint"),
                Err(e) => warn!(checkpoint_id = %meta.id, error = %e, "Failed to delete old checkpoint"),
            }
        }
    }
}

/// Thread-safe handle to checkpoint manager
pub type CheckpointManagerHandle = Arc<CheckpointManager>;

/// Write `progress.json` last, then move staging into place
async fn commit(mut writer: CheckpointWriter, file: &ProgressFile) -> Result<()> {
    writer.put_json(PROGRESS_FILE, file).await?;
    writer.commit().await
}

async fn write_gathered(
    writer: &mut CheckpointWriter,
    dir: &str,
    prefix: &str,
    full: &FullParameters,
) -> Result<Vec<(String, String)>> {
    let mut files = Vec::with_capacity(full.len());
    for (index, (name, tensor)) in full.iter().enumerate() {
        let file = format!("{}{}", prefix, tensor_file(index, name));
        writer
            .put(&format!("{}/{}", dir, file), encode_tensor(tensor))
            .await?;
        files.push((name.clone(), file));
    }
    Ok(files)
}

fn first_failure(statuses: &[Option<String>]) -> Option<(Rank, String)> {
    statuses
        .iter()
        .enumerate()
        .find_map(|(rank, status)| status.clone().map(|reason| (rank, reason)))
}

fn load_error(id: &str, reason: impl Into<String>) -> Error {
    Error::CheckpointLoad {
        checkpoint_id: id.to_string(),
        reason: reason.into(),
    }
}
