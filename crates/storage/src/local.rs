//! Local filesystem storage backend

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Storage rooted at one directory; every path is relative to it
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Hidden sibling of `target` that receives the bytes before the rename
    fn scratch_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    async fn ensure_parent(target: &Path, path: &str) -> Result<()> {
        match target.parent() {
            Some(parent) => fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, "create parent of", e)),
            None => Ok(()),
        }
    }

    async fn write_scratch(scratch: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(scratch).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    /// Relative paths of every file below `dir`
    async fn walk(&self, dir: PathBuf) -> Vec<String> {
        let mut files = Vec::new();
        let mut pending = vec![dir];

        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(kind) = entry.file_type().await else {
                    continue;
                };
                let path = entry.path();
                if kind.is_dir() {
                    pending.push(path);
                } else if kind.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        files.push(relative.to_string_lossy().into_owned());
                    }
                }
            }
        }
        files
    }
}

fn io_error(path: &str, action: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("Failed to {} {}: {}", action, path, e),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        fs::read(self.full(path))
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(path, "read", e))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.full(path);
        Self::ensure_parent(&target, path).await?;

        let scratch = Self::scratch_for(&target);
        if let Err(e) = Self::write_scratch(&scratch, &data).await {
            let _ = fs::remove_file(&scratch).await;
            return Err(Error::Storage {
                message: format!("Failed to write {}: {}", path, e),
            });
        }
        fs::rename(&scratch, &target)
            .await
            .map_err(|e| io_error(path, "publish", e))?;

        debug!(path = path, bytes = data.len(), "Wrote file");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full(path))
            .await
            .map_err(|e| io_error(path, "delete", e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(path, "stat", e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = self.full(prefix);
        let dir = if start.is_dir() {
            start
        } else {
            match start.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(Vec::new()),
            }
        };

        let mut files: Vec<String> = self
            .walk(dir)
            .await
            .into_iter()
            .filter(|f| f.starts_with(prefix))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.full(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir, "list", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(dir, "list", e))?
        {
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full(to);
        if self.exists(to).await? {
            return Err(Error::Storage {
                message: format!("Refusing to rename {} over existing {}", from, to),
            });
        }
        Self::ensure_parent(&target, to).await?;

        fs::rename(self.full(from), &target)
            .await
            .map_err(|e| io_error(from, "rename", e))?;
        debug!(from = from, to = to, "Renamed");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_dir(&self, path: &str) -> Result<()> {
        fs::remove_dir_all(self.full(path))
            .await
            .map_err(|e| io_error(path, "delete directory", e))
    }
}
