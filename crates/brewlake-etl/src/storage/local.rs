//! Filesystem-backed object store
//!
//! Keys map to paths under a root directory. Writes go to a temporary sibling
//! first and are then renamed (or hard-linked, for create-only writes) into
//! place, so a reader sees either the old object or the complete new one.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ObjectStore, UploadResult};

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(anyhow!("Invalid object key: '{}'", key));
        }
        Ok(self.root.join(relative))
    }

    async fn write_temp(&self, path: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("Object path has no parent: {}", path.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!("{}{}{}", file_name, TEMP_MARKER, Uuid::new_v4().simple()));
        tokio::fs::write(&temp, data)
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        Ok(temp)
    }

    /// Remove now-empty directories between `path` and the root
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    #[instrument(skip(self, data, _content_type))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let path = self.path_for(key)?;
        let result = UploadResult::for_body(key, &data);

        let temp = self.write_temp(&path, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("Failed to publish {}", path.display()));
        }

        debug!(size = result.size, "Wrote object");
        Ok(result)
    }

    #[instrument(skip(self, data, _content_type))]
    async fn put_if_absent(
        &self,
        key: &str,
        data: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<Option<UploadResult>> {
        let path = self.path_for(key)?;
        let result = UploadResult::for_body(key, &data);

        let temp = self.write_temp(&path, &data).await?;
        let linked = tokio::fs::hard_link(&temp, &path).await;
        let _ = tokio::fs::remove_file(&temp).await;

        match linked {
            Ok(()) => Ok(Some(result)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Object already exists, conditional write skipped");
                Ok(None)
            },
            Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await? && path.is_file())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let keys = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&root) {
                let entry = entry.context("Failed to walk local store")?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root)?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TEMP_MARKER) || !key.starts_with(&prefix) {
                    continue;
                }
                keys.push(key);
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| anyhow!("Local listing task failed: {}", e))??;

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                Ok(())
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        let written = store.put("a/b/c.json", b"one".to_vec(), None).await.unwrap();
        assert_eq!(written.size, 3);
        store.put("a/b/c.json", b"two".to_vec(), None).await.unwrap();

        assert_eq!(store.get("a/b/c.json").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get("a/b/missing.json").await.unwrap(), None);
        assert!(store.exists("a/b/c.json").await.unwrap());
        assert!(!store.exists("a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_if_absent_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.put_if_absent("lock", b"first".to_vec(), None).await.unwrap().is_some());
        assert!(store.put_if_absent("lock", b"second".to_vec(), None).await.unwrap().is_none());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.list("").await.unwrap(), vec!["lock".to_string()]);
    }

    #[tokio::test]
    async fn test_list_and_delete_prefix() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        for key in ["layer/g1/x", "layer/g1/y", "layer/g2/x", "other/z"] {
            store.put(key, b"-".to_vec(), None).await.unwrap();
        }

        assert_eq!(
            store.list("layer/").await.unwrap(),
            vec!["layer/g1/x", "layer/g1/y", "layer/g2/x"]
        );
        assert_eq!(store.delete_prefix("layer/g1/").await.unwrap(), 2);
        assert_eq!(store.list("layer/").await.unwrap(), vec!["layer/g2/x"]);
        assert!(!dir.path().join("layer/g1").exists());

        store.delete("layer/g2/missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.put("../escape", b"x".to_vec(), None).await.is_err());
        assert!(store.put("/abs", b"x".to_vec(), None).await.is_err());
        assert!(store.get("").await.is_err());
    }
}
