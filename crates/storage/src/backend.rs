//! Storage backend trait definition

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
///
/// All paths are relative to the backend's root. Missing paths surface as
/// `Error::StoragePathNotFound`, every other failure as `Error::Storage`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a whole file
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write a whole file, creating parent directories
    ///
    /// The file is either fully written or absent; readers never observe a
    /// partial file. Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete a single file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all files under a prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Names of the immediate subdirectories of `dir`, sorted
    async fn list_dirs(&self, dir: &str) -> Result<Vec<String>>;

    /// Atomically move a file or directory; fails if `to` already exists
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Recursively delete a directory
    async fn delete_dir(&self, path: &str) -> Result<()>;
}

/// Shared handle to a storage backend
pub type StorageHandle = Arc<dyn StorageBackend>;
