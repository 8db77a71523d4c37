//! Staged checkpoint writing
//!
//! Artifacts go into a hidden staging directory; the checkpoint only becomes
//! visible when the whole directory is renamed into place.

use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use runtime_core::Result;
use storage::StorageHandle;

use crate::format::staging_dir;

/// Writes the artifacts of one checkpoint into its staging directory
pub struct CheckpointWriter {
    storage: StorageHandle,
    checkpoint_id: String,
    staging: String,
    bytes_written: u64,
    files_written: usize,
    started: Instant,
}

impl CheckpointWriter {
    pub fn new(storage: StorageHandle, checkpoint_id: impl Into<String>) -> Self {
        let checkpoint_id = checkpoint_id.into();
        let staging = staging_dir(&checkpoint_id);
        Self {
            storage,
            checkpoint_id,
            staging,
            bytes_written: 0,
            files_written: 0,
            started: Instant::now(),
        }
    }

    pub fn staging(&self) -> &str {
        &self.staging
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write one artifact at `path` relative to the checkpoint root
    pub async fn put(&mut self, path: &str, data: Bytes) -> Result<()> {
        let full = format!("{}/{}", self.staging, path);
        let size = self.storage.write(&full, data).await?;
        self.bytes_written += size;
        self.files_written += 1;
        debug!(checkpoint_id = %self.checkpoint_id, path = %path, size_bytes = size, "Staged artifact");
        Ok(())
    }

    pub async fn put_json<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.put(path, Bytes::from(data)).await
    }

    /// Rename the staging directory to its final name
    #[instrument(skip(self), fields(checkpoint_id = %self.checkpoint_id))]
    pub async fn commit(self) -> Result<()> {
        self.storage
            .rename(&self.staging, &self.checkpoint_id)
            .await?;

        let elapsed = self.started.elapsed();
        info!(
            checkpoint_id = %self.checkpoint_id,
            files = self.files_written,
            size_bytes = self.bytes_written,
            elapsed_ms = elapsed.as_millis(),
            throughput_mbps = (self.bytes_written as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
            "Checkpoint staging committed"
        );
        Ok(())
    }

    /// Discard the staging directory; failures are logged
    pub async fn abort(storage: &StorageHandle, checkpoint_id: &str) {
        let staging = staging_dir(checkpoint_id);
        match storage.exists(&staging).await {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = storage.delete_dir(&staging).await {
                    warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to discard staging directory");
                } else {
                    debug!(checkpoint_id = %checkpoint_id, "Discarded staging directory");
                }
            }
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to inspect staging directory");
            }
        }
    }
}
