//! Cross-process run lock
//!
//! A marker object created with a create-if-absent write. Whoever creates it
//! owns the lake until the guard is released; a marker older than the
//! configured TTL is treated as abandoned and broken.

use brewlake_common::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::{EtlError, Result};
use crate::lake::publish::JSON_CONTENT_TYPE;
use crate::storage::ObjectStore;

/// Contents of the lock marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: RunId,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn for_run(run_id: &RunId) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            run_id: run_id.clone(),
            host,
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

pub struct RunLock {
    store: Arc<dyn ObjectStore>,
    key: String,
    ttl: Duration,
}

impl RunLock {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    /// Current holder, if the lock is taken
    pub async fn holder(&self) -> Result<Option<LockInfo>> {
        match self.store.get(&self.key).await? {
            Some(body) => Ok(serde_json::from_slice(&body).ok()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn acquire(&self, run_id: &RunId) -> Result<LockGuard> {
        let info = LockInfo::for_run(run_id);
        let body = serde_json::to_vec_pretty(&info)?;

        // One retry after breaking a stale or vanished lock
        for _ in 0..2 {
            if self
                .store
                .put_if_absent(&self.key, body.clone(), Some(JSON_CONTENT_TYPE))
                .await?
                .is_some()
            {
                info!(run_id = %run_id, host = %info.host, "Acquired run lock");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    key: self.key.clone(),
                    info,
                    released: false,
                });
            }

            let existing = self.store.get(&self.key).await?;
            let holder = existing
                .as_deref()
                .and_then(|b| serde_json::from_slice::<LockInfo>(b).ok());

            match (existing, holder) {
                // Released between the write and the read
                (None, _) => continue,
                (Some(_), Some(holder)) if holder.age() <= self.ttl => {
                    return Err(EtlError::RunLocked {
                        holder: holder.run_id.to_string(),
                        acquired_at: holder.acquired_at.to_rfc3339(),
                    });
                },
                (Some(_), holder) => {
                    warn!(
                        holder = ?holder.as_ref().map(|h| h.run_id.to_string()),
                        host = ?holder.as_ref().map(|h| h.host.clone()),
                        ttl_secs = self.ttl.as_secs(),
                        "Breaking stale run lock"
                    );
                    self.store.delete(&self.key).await?;
                },
            }
        }

        let holder = self.holder().await?;
        Err(EtlError::RunLocked {
            holder: holder
                .as_ref()
                .map(|h| h.run_id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            acquired_at: holder
                .map(|h| h.acquired_at.to_rfc3339())
                .unwrap_or_default(),
        })
    }
}

/// Ownership of the run lock; call [`LockGuard::release`] when done
pub struct LockGuard {
    store: Arc<dyn ObjectStore>,
    key: String,
    info: LockInfo,
    released: bool,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Remove the marker if this run still owns it
    pub async fn release(mut self) -> Result<()> {
        self.released = true;

        let current = match self.store.get(&self.key).await? {
            Some(body) => serde_json::from_slice::<LockInfo>(&body).ok(),
            None => {
                warn!(key = %self.key, "Run lock already gone at release");
                return Ok(());
            },
        };

        if current.as_ref() != Some(&self.info) {
            warn!(
                key = %self.key,
                run_id = %self.info.run_id,
                "Run lock taken over by another run, leaving it in place"
            );
            return Ok(());
        }

        self.store.delete(&self.key).await?;
        info!(run_id = %self.info.run_id, "Released run lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                key = %self.key,
                run_id = %self.info.run_id,
                "Run lock guard dropped without release; lock stays until its TTL expires"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const KEY: &str = "_locks/brewlake.lock";

    fn lock(dir: &TempDir, ttl: Duration) -> RunLock {
        RunLock::new(Arc::new(LocalStore::new(dir.path())), KEY, ttl)
    }

    fn run(id: &str) -> RunId {
        id.parse().unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, Duration::from_secs(3600));

        let guard = lock.acquire(&run("20240101_000000")).await.unwrap();
        assert_eq!(lock.holder().await.unwrap().unwrap().run_id, run("20240101_000000"));

        guard.release().await.unwrap();
        assert!(lock.holder().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_acquire_is_locked() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, Duration::from_secs(3600));

        let guard = lock.acquire(&run("20240101_000000")).await.unwrap();
        let err = lock.acquire(&run("20240101_000001")).await.err().unwrap();
        match err {
            EtlError::RunLocked { holder, .. } => assert_eq!(holder, "20240101_000000"),
            other => panic!("unexpected error: {other}"),
        }
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, Duration::from_secs(60));

        let stale = LockInfo {
            run_id: run("20230101_000000"),
            host: "elsewhere".to_string(),
            acquired_at: Utc::now() - ChronoDuration::hours(2),
        };
        lock.store
            .put(KEY, serde_json::to_vec(&stale).unwrap(), None)
            .await
            .unwrap();

        let guard = lock.acquire(&run("20240101_000000")).await.unwrap();
        assert_eq!(guard.info().run_id, run("20240101_000000"));
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, Duration::from_secs(60));
        lock.store.put(KEY, b"garbage".to_vec(), None).await.unwrap();

        let guard = lock.acquire(&run("20240101_000000")).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, Duration::from_secs(3600));
        let guard = lock.acquire(&run("20240101_000000")).await.unwrap();

        let other = LockInfo::for_run(&run("20240101_000009"));
        lock.store
            .put(KEY, serde_json::to_vec(&other).unwrap(), None)
            .await
            .unwrap();

        guard.release().await.unwrap();
        assert_eq!(lock.holder().await.unwrap(), Some(other));
    }
}
