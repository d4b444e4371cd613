//! Generation-based atomic publication of a layer
//!
//! A layer's objects are staged under `<layer>/generations/<generation>/`.
//! Once every object is written, a [`LayerManifest`] is stored in the
//! generation and then copied to `<layer>/_CURRENT.json`. That single write is
//! the commit point: readers always resolve a layer through `_CURRENT.json`,
//! so they see either the previous generation or the complete new one.

use brewlake_common::{checksum, RunId};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::layout::{self, LakeLayout, Layer, GENERATION_MANIFEST};
use crate::error::{EtlError, Result};
use crate::storage::ObjectStore;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Object writes in flight per publication
const WRITE_CONCURRENCY: usize = 8;

/// An object waiting to be published, keyed relative to its generation
#[derive(Debug, Clone)]
pub struct StagedObject {
    pub relative_key: String,
    pub partition: Option<String>,
    pub record_count: u64,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    pub record_count: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Description of one published generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerManifest {
    pub layer: String,
    pub run_id: RunId,
    /// Raw batch the layer was derived from
    pub source_run: RunId,
    pub generation: String,
    pub published_at: DateTime<Utc>,
    pub objects: Vec<ManifestEntry>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl LayerManifest {
    pub fn record_count(&self) -> u64 {
        self.objects.iter().map(|o| o.record_count).sum()
    }

    /// Entry whose key ends with `relative_key`
    pub fn entry(&self, relative_key: &str) -> Option<&ManifestEntry> {
        self.objects
            .iter()
            .find(|o| o.key.ends_with(&format!("/{relative_key}")))
    }
}

/// Generation metadata shared by every object of one publication
#[derive(Debug, Clone)]
pub struct Publication {
    pub layer: Layer,
    pub run_id: RunId,
    pub source_run: RunId,
    pub metadata: serde_json::Value,
}

pub struct LayerPublisher {
    store: Arc<dyn ObjectStore>,
    layout: LakeLayout,
    retain_generations: usize,
}

impl LayerPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, layout: LakeLayout, retain_generations: usize) -> Self {
        Self {
            store,
            layout,
            retain_generations: retain_generations.max(1),
        }
    }

    pub fn layout(&self) -> &LakeLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Stage every object, then commit the manifest.
    ///
    /// Any failure before the commit removes the staged generation and leaves
    /// the previously published one current.
    #[instrument(skip(self, publication, objects), fields(layer = %publication.layer, objects = objects.len()))]
    pub async fn publish(
        &self,
        publication: Publication,
        objects: Vec<StagedObject>,
    ) -> Result<LayerManifest> {
        let layer = publication.layer;
        let generation = layout::new_generation(&publication.run_id);

        let store = &self.store;
        let generation_ref = generation.as_str();
        let writes = objects.into_iter().map(|object| async move {
            let key = self.layout.object_key(layer, generation_ref, &object.relative_key);
            let result = store.put(&key, object.body, Some(object.content_type)).await;
            (object.relative_key, object.partition, object.record_count, result)
        });
        let results: Vec<_> = stream::iter(writes).buffered(WRITE_CONCURRENCY).collect().await;

        let mut entries = Vec::with_capacity(results.len());
        for (relative_key, partition, record_count, result) in results {
            match result {
                Ok(written) => entries.push(ManifestEntry {
                    key: written.key,
                    partition,
                    record_count,
                    bytes: written.size,
                    sha256: written.checksum,
                }),
                Err(e) => {
                    let failed = partition.unwrap_or(relative_key);
                    return Err(self.abort(layer, &generation, failed, e).await);
                },
            }
        }

        let manifest = LayerManifest {
            layer: layer.as_str().to_string(),
            run_id: publication.run_id,
            source_run: publication.source_run,
            generation: generation.clone(),
            published_at: Utc::now(),
            objects: entries,
            metadata: publication.metadata,
        };
        let body = serde_json::to_vec_pretty(&manifest)?;

        let staged_manifest = self.layout.object_key(layer, &generation, GENERATION_MANIFEST);
        if let Err(e) = self
            .store
            .put(&staged_manifest, body.clone(), Some(JSON_CONTENT_TYPE))
            .await
        {
            return Err(self.abort(layer, &generation, GENERATION_MANIFEST.to_string(), e).await);
        }

        let current = self.layout.current_manifest_key(layer);
        if let Err(e) = self.store.put(&current, body, Some(JSON_CONTENT_TYPE)).await {
            return Err(self.abort(layer, &generation, current, e).await);
        }

        info!(
            generation = %generation,
            objects = manifest.objects.len(),
            records = manifest.record_count(),
            "Published layer generation"
        );

        self.collect_garbage(layer, &generation).await;
        Ok(manifest)
    }

    async fn abort(
        &self,
        layer: Layer,
        generation: &str,
        partition: String,
        cause: anyhow::Error,
    ) -> EtlError {
        error!(
            layer = %layer,
            generation = %generation,
            partition = %partition,
            error = %format!("{cause:#}"),
            "Layer write failed, discarding staged generation"
        );

        let prefix = self.layout.generation_prefix(layer, generation);
        if let Err(e) = self.store.delete_prefix(&prefix).await {
            warn!(prefix = %prefix, error = %e, "Failed to clean up staged generation");
        }

        EtlError::PartitionWriteFailure {
            layer: layer.as_str().to_string(),
            partition,
            message: format!("{cause:#}"),
        }
    }

    /// Manifest of the currently published generation
    pub async fn current(&self, layer: Layer) -> Result<Option<LayerManifest>> {
        let key = self.layout.current_manifest_key(layer);
        match self.store.get(&key).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    /// Fetch one published object and check it against its manifest checksum
    pub async fn read_object(&self, entry: &ManifestEntry) -> Result<Vec<u8>> {
        let data = self
            .store
            .get(&entry.key)
            .await?
            .ok_or_else(|| EtlError::NotFound(entry.key.clone()))?;
        checksum::verify_sha256(&data, &entry.sha256)?;
        Ok(data)
    }

    /// Delete generations beyond the newest `retain_generations`.
    ///
    /// Best effort: failures are logged and never fail the publication.
    pub async fn collect_garbage(&self, layer: Layer, current: &str) -> usize {
        let prefix = self.layout.generations_prefix(layer);
        let keys = match self.store.list(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(layer = %layer, error = %e, "Failed to list generations");
                return 0;
            },
        };

        let generations: BTreeSet<&str> = keys
            .iter()
            .filter_map(|key| layout::generation_of(&prefix, key))
            .collect();

        let stale: Vec<&str> = generations
            .iter()
            .rev()
            .skip(self.retain_generations)
            .copied()
            .filter(|g| *g != current)
            .collect();

        let mut removed = 0;
        for generation in stale {
            let generation_prefix = self.layout.generation_prefix(layer, generation);
            match self.store.delete_prefix(&generation_prefix).await {
                Ok(_) => {
                    debug!(layer = %layer, generation = %generation, "Removed old generation");
                    removed += 1;
                },
                Err(e) => {
                    warn!(layer = %layer, generation = %generation, error = %e, "Failed to remove old generation");
                },
            }
        }
        removed
    }
}
