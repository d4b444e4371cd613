//! Error types for the ETL engine

use crate::models::CurationStats;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors that abort a stage.
///
/// Record-level defects never surface here; they are tallied in
/// [`CurationStats`] instead.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Page fetch retries exhausted; nothing was written to the raw layer
    #[error("upstream unavailable at {url} after {attempts} attempts: {message}")]
    UpstreamUnavailable {
        url: String,
        attempts: u32,
        message: String,
    },

    /// Too few raw records passed validation
    #[error(
        "excessive invalid rate: {valid} of {total} records valid, minimum fraction is {min_valid_fraction}",
        valid = .stats.valid_records(),
        total = .stats.input_records
    )]
    ExcessiveInvalidRate {
        stats: Box<CurationStats>,
        min_valid_fraction: f64,
    },

    /// A staged layer object could not be written; the previous generation stays current
    #[error("failed to write {layer} partition '{partition}': {message}")]
    PartitionWriteFailure {
        layer: String,
        partition: String,
        message: String,
    },

    /// Aggregate counts disagree with the curated input
    #[error("aggregation inconsistency in {check}: expected {expected}, got {actual}")]
    AggregationInconsistency {
        check: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("raw batch already exists at {0}")]
    RawBatchExists(String),

    #[error("pipeline is locked by run {holder} (acquired {acquired_at})")]
    RunLocked { holder: String, acquired_at: String },

    /// A stage's input layer has never been published
    #[error("layer '{0}' has no published generation")]
    LayerEmpty(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid run state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] brewlake_common::CommonError),
}

impl EtlError {
    /// Defect counts carried by the error, when curation got that far
    pub fn curation_stats(&self) -> Option<&CurationStats> {
        match self {
            EtlError::ExcessiveInvalidRate { stats, .. } => Some(stats),
            _ => None,
        }
    }
}
