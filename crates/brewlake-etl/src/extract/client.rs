//! Open Brewery DB HTTP client

use anyhow::{anyhow, Context};
use reqwest::Client;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::{EtlError, Result};

/// Records of every page fetched, in page order
#[derive(Debug, Default)]
pub struct FetchedPages {
    pub records: Vec<Box<RawValue>>,
    pub pages_fetched: usize,
    /// Pagination stopped because `max_pages` was reached
    pub capped: bool,
}

pub struct BreweryClient {
    client: Client,
    config: SourceConfig,
}

impl BreweryClient {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint_url
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Walk pages from 1 until a short or empty page, or the page cap
    pub async fn fetch_all(&self) -> Result<FetchedPages> {
        let mut fetched = FetchedPages::default();

        for page in 1..=self.config.max_pages {
            let records = self.fetch_page_with_retry(page).await?;
            let count = records.len();
            fetched.pages_fetched = page;
            fetched.records.extend(records);

            debug!(page, records = count, "Fetched page");

            if count < self.config.page_size {
                info!(
                    pages = fetched.pages_fetched,
                    records = fetched.records.len(),
                    "Reached last page"
                );
                return Ok(fetched);
            }
        }

        warn!(
            max_pages = self.config.max_pages,
            records = fetched.records.len(),
            "Page cap reached before the upstream ran out of records"
        );
        fetched.capped = true;
        Ok(fetched)
    }

    /// Fetch one page, retrying up to `max_retries` times with exponential backoff
    pub async fn fetch_page_with_retry(&self, page: usize) -> Result<Vec<Box<RawValue>>> {
        let max_attempts = self.config.max_attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.fetch_page(page).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    warn!(
                        page,
                        attempt,
                        max_attempts,
                        error = %format!("{e:#}"),
                        "Page fetch failed"
                    );
                    last_error = Some(e);

                    if attempt < max_attempts {
                        let delay = self.config.backoff(attempt);
                        info!(page, delay_ms = delay.as_millis() as u64, "Retrying page fetch");
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }

        Err(EtlError::UpstreamUnavailable {
            url: format!("{}?page={}&per_page={}", self.config.endpoint_url, page, self.config.page_size),
            attempts: max_attempts,
            message: last_error
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Fetch one page without retry
    async fn fetch_page(&self, page: usize) -> anyhow::Result<Vec<Box<RawValue>>> {
        let response = self
            .client
            .get(&self.config.endpoint_url)
            .query(&[("page", page), ("per_page", self.config.page_size)])
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP error: {}", status));
        }

        let body = response.bytes().await.context("failed to read response body")?;
        serde_json::from_slice::<Vec<Box<RawValue>>>(&body)
            .context("response body is not a JSON array")
    }
}
