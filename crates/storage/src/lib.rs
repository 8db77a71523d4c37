//! Storage - Backends for checkpoint artifacts
//!
//! Files are written atomically (temp file, then rename) and whole
//! directories can be renamed into place, which is what makes a staged
//! checkpoint appear all at once.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write(".tmp-run/progress.json", Bytes::from_static(b"{}")).await?;
//! storage.rename(".tmp-run", "run").await?;
//! let data = storage.read("run/progress.json").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{StorageBackend, StorageHandle};
pub use local::LocalStorage;
