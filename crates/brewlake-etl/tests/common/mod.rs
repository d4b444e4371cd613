//! Shared fixtures for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use brewlake_etl::config::{PipelineConfig, SourceConfig, StorageBackend};
use brewlake_etl::storage::{LocalStore, ObjectStore, UploadResult};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const API_PATH: &str = "/v1/breweries";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("brewlake_etl=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn brewery(id: &str, brewery_type: &str, country: Value, state: Value) -> Value {
    json!({
        "id": id,
        "name": format!("Brewery {id}"),
        "brewery_type": brewery_type,
        "city": "Springfield",
        "country": country,
        "state": state,
        "latitude": "39.78",
        "longitude": "-89.65",
    })
}

/// `count` valid breweries with ids `<prefix>-<n>`
pub fn breweries(prefix: &str, count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| brewery(&format!("{prefix}-{i}"), "micro", json!("United States"), json!("Oregon")))
        .collect()
}

/// Mount one mock per page, 1-based, answering `per_page=page_size`
pub async fn mount_pages(server: &MockServer, page_size: usize, pages: &[Vec<Value>]) {
    for (index, records) in pages.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .and(query_param("page", (index + 1).to_string()))
            .and(query_param("per_page", page_size.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(records))
            .mount(server)
            .await;
    }
}

pub fn config(server: &MockServer, dir: &TempDir, page_size: usize) -> PipelineConfig {
    PipelineConfig {
        source: SourceConfig {
            endpoint_url: format!("{}{}", server.uri(), API_PATH),
            page_size,
            max_retries: 3,
            backoff_base_ms: 1,
            timeout_secs: 5,
            ..Default::default()
        },
        storage: StorageBackend::Local {
            root: dir.path().to_path_buf(),
        },
        ..Default::default()
    }
}

/// Local store that can be told to fail writes to keys containing a marker
pub struct FailingStore {
    inner: LocalStore,
    fail_on: Mutex<Option<String>>,
}

impl FailingStore {
    pub fn new(dir: &TempDir) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalStore::new(dir.path()),
            fail_on: Mutex::new(None),
        })
    }

    pub fn fail_writes_containing(&self, marker: &str) {
        *self.fail_on.lock().unwrap() = Some(marker.to_string());
    }

    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    fn should_fail(&self, key: &str) -> bool {
        self.fail_on
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|marker| key.contains(marker))
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    fn describe(&self) -> String {
        format!("failing+{}", self.inner.describe())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> anyhow::Result<UploadResult> {
        if self.should_fail(key) {
            anyhow::bail!("injected write failure for {key}");
        }
        self.inner.put(key, data, content_type).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> anyhow::Result<Option<UploadResult>> {
        if self.should_fail(key) {
            anyhow::bail!("injected write failure for {key}");
        }
        self.inner.put_if_absent(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key).await
    }
}
