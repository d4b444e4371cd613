//! Extraction: upstream API into the raw layer
//!
//! One run produces exactly one immutable raw object. It is written with a
//! create-if-absent put, so an existing batch for the same run id is never
//! overwritten.

pub mod client;

use brewlake_common::{checksum, RunId};
use chrono::Utc;
use tracing::{info, instrument};

pub use client::{BreweryClient, FetchedPages};

use crate::config::SourceConfig;
use crate::error::{EtlError, Result};
use crate::lake::publish::JSON_CONTENT_TYPE;
use crate::lake::Lake;
use crate::models::{RawBatch, RawBatchRef};

pub struct Extractor {
    client: BreweryClient,
}

impl Extractor {
    pub fn new(config: SourceConfig) -> Result<Self> {
        Ok(Self {
            client: BreweryClient::new(config)?,
        })
    }

    /// Fetch every page into a batch; nothing is written
    #[instrument(skip(self), fields(endpoint = %self.client.endpoint()))]
    pub async fn extract(&self, run_id: &RunId) -> Result<RawBatch> {
        let fetched = self.client.fetch_all().await?;

        Ok(RawBatch {
            run_id: run_id.clone(),
            extracted_at: Utc::now(),
            source_endpoint: self.client.endpoint().to_string(),
            page_size: self.client.page_size(),
            pages_fetched: fetched.pages_fetched,
            record_count: fetched.records.len(),
            records: fetched.records,
        })
    }

    /// Extract and land the batch in the raw layer
    #[instrument(skip(self, lake))]
    pub async fn extract_to_lake(&self, lake: &Lake, run_id: &RunId) -> Result<RawBatchRef> {
        let key = lake.layout().raw_batch_key(run_id);
        if lake.store().exists(&key).await? {
            return Err(EtlError::RawBatchExists(key));
        }

        let batch = self.extract(run_id).await?;
        write_raw_batch(lake, &batch).await
    }
}

/// Store a batch at its run's raw key without overwriting
pub async fn write_raw_batch(lake: &Lake, batch: &RawBatch) -> Result<RawBatchRef> {
    let key = lake.layout().raw_batch_key(&batch.run_id);
    let body = serde_json::to_vec(batch)?;
    let sha256 = checksum::sha256_hex(&body);

    let written = lake
        .store()
        .put_if_absent(&key, body, Some(JSON_CONTENT_TYPE))
        .await?;
    if written.is_none() {
        return Err(EtlError::RawBatchExists(key));
    }

    info!(
        key = %key,
        records = batch.record_count,
        pages = batch.pages_fetched,
        "Raw batch written"
    );

    Ok(RawBatchRef {
        key,
        run_id: batch.run_id.clone(),
        record_count: batch.record_count,
        sha256,
    })
}
