//! The three-layer lake on top of an [`ObjectStore`]

pub mod layout;
pub mod lock;
pub mod publish;

use std::sync::Arc;
use std::time::Duration;

pub use layout::{LakeLayout, Layer};
pub use lock::{LockGuard, LockInfo, RunLock};
pub use publish::{LayerManifest, LayerPublisher, ManifestEntry, Publication, StagedObject};

use crate::config::LakeConfig;
use crate::error::{EtlError, Result};
use crate::models::RawBatch;
use crate::storage::ObjectStore;

/// Handle on one lake: store, key layout and publisher
pub struct Lake {
    publisher: LayerPublisher,
    lock_ttl: Duration,
}

impl Lake {
    pub fn new(store: Arc<dyn ObjectStore>, config: &LakeConfig) -> Self {
        Self {
            publisher: LayerPublisher::new(
                store,
                LakeLayout::new(config),
                config.retain_generations,
            ),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        self.publisher.store()
    }

    pub fn layout(&self) -> &LakeLayout {
        self.publisher.layout()
    }

    pub fn publisher(&self) -> &LayerPublisher {
        &self.publisher
    }

    pub fn run_lock(&self) -> RunLock {
        RunLock::new(
            Arc::clone(self.store()),
            self.layout().lock_key(),
            self.lock_ttl,
        )
    }

    pub async fn current(&self, layer: Layer) -> Result<Option<LayerManifest>> {
        self.publisher.current(layer).await
    }

    /// Current manifest, or `LayerEmpty` when the layer was never published
    pub async fn require_current(&self, layer: Layer) -> Result<LayerManifest> {
        self.current(layer)
            .await?
            .ok_or_else(|| EtlError::LayerEmpty(self.layout().prefix(layer).to_string()))
    }

    pub async fn read_raw_batch(&self, key: &str) -> Result<RawBatch> {
        let body = self
            .store()
            .get(key)
            .await?
            .ok_or_else(|| EtlError::NotFound(key.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Key of the newest raw batch, by run id
    pub async fn latest_raw_key(&self) -> Result<Option<String>> {
        let keys = self.store().list(&self.layout().raw_batches_prefix()).await?;
        Ok(keys
            .into_iter()
            .filter(|k| k.ends_with(layout::RAW_BATCH_FILE))
            .filter_map(|k| layout::raw_run_id(&k).map(|run| (run, k)))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, k)| k))
    }
}
