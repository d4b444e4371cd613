//! Configuration management
//!
//! All settings come from the environment (optionally seeded from a `.env`
//! file). The CLI may override individual values after loading.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EtlError, Result};
use crate::storage::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Open Brewery DB collection endpoint.
pub const DEFAULT_SOURCE_URL: &str = "https://api.openbrewerydb.org/v1/breweries";

/// Records requested per page; the upstream caps `per_page` at 200.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Maximum page size accepted by the upstream API.
pub const MAX_PAGE_SIZE: usize = 200;

/// Safety cap on the number of pages fetched in one run.
pub const DEFAULT_MAX_PAGES: usize = 1000;

/// Per-request HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Retries per page fetch after the first attempt fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff delay in milliseconds; doubles on every retry.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Minimum share of raw records that must pass validation.
pub const DEFAULT_MIN_VALID_FRACTION: f64 = 0.5;

pub const DEFAULT_LOCAL_ROOT: &str = "./lake";
pub const DEFAULT_RAW_PREFIX: &str = "raw";
pub const DEFAULT_CURATED_PREFIX: &str = "curated";
pub const DEFAULT_ANALYTICAL_PREFIX: &str = "analytical";
pub const DEFAULT_RUNS_PREFIX: &str = "runs";
pub const DEFAULT_LOCK_KEY: &str = "_locks/brewlake.lock";

/// Locks older than this are considered abandoned (6 hours).
pub const DEFAULT_LOCK_TTL_SECS: u64 = 21_600;

/// Published generations kept per layer, the current one included.
pub const DEFAULT_RETAIN_GENERATIONS: usize = 2;

const USER_AGENT: &str = concat!("brewlake-etl/", env!("CARGO_PKG_VERSION"));

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub curation: CurationPolicy,
    pub lake: LakeConfig,
    pub storage: StorageBackend,
}

/// Upstream API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub endpoint_url: String,
    pub page_size: usize,
    pub max_pages: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub user_agent: String,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Total requests per page: the first attempt plus `max_retries`
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_SOURCE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Data-quality policy applied by the curator
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurationPolicy {
    pub min_valid_fraction: f64,
}

impl Default for CurationPolicy {
    fn default() -> Self {
        Self {
            min_valid_fraction: DEFAULT_MIN_VALID_FRACTION,
        }
    }
}

/// Key layout of the lake inside the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    pub raw_prefix: String,
    pub curated_prefix: String,
    pub analytical_prefix: String,
    pub runs_prefix: String,
    pub lock_key: String,
    pub lock_ttl_secs: u64,
    pub retain_generations: usize,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            raw_prefix: DEFAULT_RAW_PREFIX.to_string(),
            curated_prefix: DEFAULT_CURATED_PREFIX.to_string(),
            analytical_prefix: DEFAULT_ANALYTICAL_PREFIX.to_string(),
            runs_prefix: DEFAULT_RUNS_PREFIX.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            retain_generations: DEFAULT_RETAIN_GENERATIONS,
        }
    }
}

/// Which object store holds the lake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    Local { root: PathBuf },
    S3(StorageConfig),
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Local {
            root: PathBuf::from(DEFAULT_LOCAL_ROOT),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EtlError::Config(format!("{name} has an invalid value: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl PipelineConfig {
    /// Read `BREWLAKE_*` variables on top of the defaults.
    ///
    /// Does not load `.env` and does not validate; callers apply overrides
    /// first and then call [`PipelineConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let source = SourceConfig {
            endpoint_url: env_string("BREWLAKE_SOURCE_URL", DEFAULT_SOURCE_URL),
            page_size: env_parse("BREWLAKE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            max_pages: env_parse("BREWLAKE_MAX_PAGES", DEFAULT_MAX_PAGES)?,
            timeout_secs: env_parse("BREWLAKE_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            max_retries: env_parse("BREWLAKE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            backoff_base_ms: env_parse("BREWLAKE_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)?,
            user_agent: USER_AGENT.to_string(),
        };

        let curation = CurationPolicy {
            min_valid_fraction: env_parse(
                "BREWLAKE_MIN_VALID_FRACTION",
                DEFAULT_MIN_VALID_FRACTION,
            )?,
        };

        let lake = LakeConfig {
            raw_prefix: env_string("BREWLAKE_RAW_PREFIX", DEFAULT_RAW_PREFIX),
            curated_prefix: env_string("BREWLAKE_CURATED_PREFIX", DEFAULT_CURATED_PREFIX),
            analytical_prefix: env_string("BREWLAKE_ANALYTICAL_PREFIX", DEFAULT_ANALYTICAL_PREFIX),
            runs_prefix: env_string("BREWLAKE_RUNS_PREFIX", DEFAULT_RUNS_PREFIX),
            lock_key: env_string("BREWLAKE_LOCK_KEY", DEFAULT_LOCK_KEY),
            lock_ttl_secs: env_parse("BREWLAKE_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS)?,
            retain_generations: env_parse(
                "BREWLAKE_RETAIN_GENERATIONS",
                DEFAULT_RETAIN_GENERATIONS,
            )?,
        };

        let storage = match env_string("BREWLAKE_STORAGE", "local").to_lowercase().as_str() {
            "local" | "file" => StorageBackend::Local {
                root: PathBuf::from(env_string("BREWLAKE_LOCAL_ROOT", DEFAULT_LOCAL_ROOT)),
            },
            "s3" | "minio" => StorageBackend::S3(
                StorageConfig::from_env().map_err(|e| EtlError::Config(e.to_string()))?,
            ),
            other => {
                return Err(EtlError::Config(format!(
                    "BREWLAKE_STORAGE must be 'local' or 's3', got '{other}'"
                )))
            },
        };

        Ok(Self {
            source,
            curation,
            lake,
            storage,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let source = &self.source;
        if source.endpoint_url.trim().is_empty() {
            return Err(EtlError::Config("source endpoint URL cannot be empty".into()));
        }
        url::Url::parse(&source.endpoint_url).map_err(|e| {
            EtlError::Config(format!("invalid source URL '{}': {e}", source.endpoint_url))
        })?;
        if source.page_size == 0 || source.page_size > MAX_PAGE_SIZE {
            return Err(EtlError::Config(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                source.page_size
            )));
        }
        if source.max_pages == 0 {
            return Err(EtlError::Config("max pages must be greater than 0".into()));
        }
        if source.timeout_secs == 0 {
            return Err(EtlError::Config("HTTP timeout must be greater than 0".into()));
        }

        let fraction = self.curation.min_valid_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(EtlError::Config(format!(
                "minimum valid fraction must be within [0, 1], got {fraction}"
            )));
        }

        let lake = &self.lake;
        let prefixes = [
            ("raw", &lake.raw_prefix),
            ("curated", &lake.curated_prefix),
            ("analytical", &lake.analytical_prefix),
            ("runs", &lake.runs_prefix),
        ];
        for (name, prefix) in prefixes {
            let trimmed = prefix.trim_matches('/');
            if trimmed.is_empty() {
                return Err(EtlError::Config(format!("{name} prefix cannot be empty")));
            }
            let overlapping = prefixes.iter().any(|(other, p)| {
                *other != name && {
                    let p = p.trim_matches('/');
                    p == trimmed || p.starts_with(&format!("{trimmed}/"))
                }
            });
            if overlapping {
                return Err(EtlError::Config(format!(
                    "{name} prefix '{prefix}' overlaps another layer"
                )));
            }
        }
        if lake.lock_key.trim_matches('/').is_empty() {
            return Err(EtlError::Config("lock key cannot be empty".into()));
        }
        if lake.retain_generations == 0 {
            return Err(EtlError::Config("retain generations must be at least 1".into()));
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            curation: CurationPolicy::default(),
            lake: LakeConfig::default(),
            storage: StorageBackend::default(),
        }
    }
}
