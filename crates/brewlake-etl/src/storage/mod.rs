//! Object storage backing the lake
//!
//! Every layer lives in a hierarchical key/value blob store. The engine only
//! needs a handful of operations, captured by [`ObjectStore`]:
//!
//! - whole-object `put` (atomic per object, as S3 PUT is)
//! - `put_if_absent`, the create-only write used for raw batches and the run lock
//! - `get`, `exists`, `list` by prefix, and `delete`
//!
//! [`S3Store`] talks to S3 or MinIO; [`LocalStore`] maps keys onto a
//! directory tree for local runs and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod config;
pub mod local;
pub mod s3;

pub use config::StorageConfig;
pub use local::LocalStore;
pub use s3::S3Store;

use crate::config::StorageBackend;

/// Outcome of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub checksum: String,
    pub size: u64,
}

impl UploadResult {
    pub(crate) fn for_body(key: &str, data: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            checksum: brewlake_common::checksum::sha256_hex(data),
            size: data.len() as u64,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket` or `file:///data/lake`
    fn describe(&self) -> String;

    /// Write an object, replacing any previous version
    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>)
        -> Result<UploadResult>;

    /// Write an object only if the key is free. Returns `None` when it already exists.
    async fn put_if_absent(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<Option<UploadResult>>;

    /// Read an object, `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}

/// Open the store selected by configuration
pub async fn open_store(backend: &StorageBackend) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match backend {
        StorageBackend::Local { root } => Arc::new(LocalStore::new(root.clone())),
        StorageBackend::S3(config) => Arc::new(S3Store::new(config.clone()).await?),
    };
    tracing::info!(location = %store.describe(), "Object store ready");
    Ok(store)
}
