//! The bulk transfer collaborator.
//!
//! Staging and output locations are prefixes in a remote store. The core
//! extracts shards into the staging prefix, downloads them for encryption,
//! and uploads ciphertexts and the manifest to the output prefix.
//! [`ObjectStoreTransfer`] is the shipped implementation.
//!
//! A staging prefix must have a single writer: two concurrent runs against
//! the same prefix clear each other's files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::extract::OutputFormat;
use crate::store::Query;

mod remote;

pub use remote::ObjectStoreTransfer;

/// Joins a prefix and a file name with exactly one `/`.
pub fn join_remote(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Bulk data movement between the data store, a remote location, and the
/// local disk.
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    /// Runs `query` and writes its rows to `remote` in `format`, replacing
    /// any existing object. Returns the written paths.
    async fn bulk_extract(
        &self,
        query: &Query,
        format: &OutputFormat,
        remote: &str,
    ) -> Result<Vec<String>>;

    /// Copies `remote` into `local_dir`, returning the local path.
    async fn download(&self, remote: &str, local_dir: &Path) -> Result<PathBuf>;

    /// Copies a local file to `remote`. Without `overwrite` an existing
    /// object is an error.
    async fn upload(&self, local: &Path, remote: &str, overwrite: bool) -> Result<()>;

    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes one object. Removing a missing object succeeds.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Checks read and write access to `prefix`.
    async fn probe(&self, prefix: &str) -> Result<()>;

    /// Removes everything under `prefix`, returning the number of objects
    /// removed. Idempotent.
    async fn clear(&self, prefix: &str) -> Result<usize> {
        let paths = self.list(prefix).await?;
        for path in &paths {
            self.remove(path).await?;
        }
        Ok(paths.len())
    }
}
