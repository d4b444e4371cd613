//! Run coordinator
//!
//! Orchestrates one pipeline run:
//! 1. Extract: fetch every upstream page into a new raw batch
//! 2. Curate: validate, deduplicate and partition the batch, publish curated
//! 3. Aggregate: summarise the curated layer, publish analytical
//!
//! Each stage starts only once the previous stage's output is published. The
//! run lock is held for the whole run, and for each stage invoked alone.

use brewlake_common::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::aggregate::{self, AggregateCounts};
use crate::config::PipelineConfig;
use crate::curate;
use crate::error::{EtlError, Result};
use crate::extract::Extractor;
use crate::lake::publish::JSON_CONTENT_TYPE;
use crate::lake::{Lake, LayerManifest, Layer, LockGuard, LockInfo};
use crate::models::{CurationStats, RawBatchRef};
use crate::storage::{self, ObjectStore};

/// Pipeline run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Extracting,
    Curating,
    Aggregating,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Extracting => "EXTRACTING",
            RunState::Curating => "CURATING",
            RunState::Aggregating => "AGGREGATING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Extracting)
            | (Extracting, Curating)
            | (Curating, Aggregating)
            | (Aggregating, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Stage running while in this state
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Extracting => Some(Stage::Extract),
            RunState::Curating => Some(Stage::Curate),
            RunState::Aggregating => Some(Stage::Aggregate),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Curate,
    Aggregate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extract => "extract",
            Stage::Curate => "curate",
            Stage::Aggregate => "aggregate",
        })
    }
}

/// Outcome of a run, persisted under the runs prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub raw_key: Option<String>,
    pub raw_records: Option<usize>,
    pub curated_generation: Option<String>,
    pub analytical_generation: Option<String>,
    pub curation_stats: Option<CurationStats>,
    pub aggregate: Option<AggregateCounts>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            failed_stage: None,
            error: None,
            raw_key: None,
            raw_records: None,
            curated_generation: None,
            analytical_generation: None,
            curation_stats: None,
            aggregate: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EtlError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(run_id = %self.run_id, from = %self.state, to = %next, "Run state changed");
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a failure in the current stage and move to `FAILED`
    pub fn fail(&mut self, err: &EtlError) {
        self.failed_stage = self.state.stage();
        self.error = Some(err.to_string());
        if let Some(stats) = err.curation_stats() {
            self.curation_stats = Some(stats.clone());
        }
        if self.transition(RunState::Failed).is_err() {
            warn!(run_id = %self.run_id, state = %self.state, "Run already finished");
        }
    }
}

/// A failed run: the report as far as it got, plus the cause
#[derive(Error, Debug)]
#[error("run {} failed: {source}", .report.run_id)]
pub struct RunError {
    pub report: Box<RunReport>,
    pub source: EtlError,
}

/// Published state of the lake
#[derive(Debug, Clone, Serialize)]
pub struct LakeStatus {
    pub location: String,
    pub latest_raw_key: Option<String>,
    pub curated: Option<LayerManifest>,
    pub analytical: Option<LayerManifest>,
    pub lock: Option<LockInfo>,
}

pub struct RunCoordinator {
    config: PipelineConfig,
    lake: Lake,
    extractor: Extractor,
}

impl RunCoordinator {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let lake = Lake::new(store, &config.lake);
        let extractor = Extractor::new(config.source.clone())?;
        Ok(Self {
            config,
            lake,
            extractor,
        })
    }

    /// Open the configured store and build a coordinator on it
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = storage::open_store(&config.storage).await?;
        Self::new(config, store)
    }

    pub fn lake(&self) -> &Lake {
        &self.lake
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full pipeline run with a fresh run id
    pub async fn run(&self) -> std::result::Result<RunReport, RunError> {
        self.run_with_id(RunId::now()).await
    }

    #[instrument(skip(self, run_id), fields(run_id = %run_id))]
    pub async fn run_with_id(&self, run_id: RunId) -> std::result::Result<RunReport, RunError> {
        let mut report = RunReport::new(run_id);
        info!("Starting pipeline run");

        // a run that never took the lock leaves no report behind
        let guard = match self.lake.run_lock().acquire(&report.run_id).await {
            Ok(guard) => guard,
            Err(source) => {
                report.fail(&source);
                error!(error = %source, "Pipeline run could not start");
                return Err(RunError {
                    report: Box::new(report),
                    source,
                });
            },
        };

        let outcome = self.execute(&mut report).await;
        self.release(guard).await;

        if let Err(source) = outcome {
            report.fail(&source);
            error!(
                failed_stage = ?report.failed_stage,
                error = %source,
                "Pipeline run failed"
            );
            self.persist_report(&report).await;
            return Err(RunError {
                report: Box::new(report),
                source,
            });
        }

        info!(
            raw_key = ?report.raw_key,
            curated_generation = ?report.curated_generation,
            analytical_generation = ?report.analytical_generation,
            "Pipeline run complete"
        );
        self.persist_report(&report).await;
        Ok(report)
    }

    async fn execute(&self, report: &mut RunReport) -> Result<()> {
        let run_id = report.run_id.clone();

        report.transition(RunState::Extracting)?;
        let raw = self.extractor.extract_to_lake(&self.lake, &run_id).await?;
        report.raw_key = Some(raw.key.clone());
        report.raw_records = Some(raw.record_count);

        report.transition(RunState::Curating)?;
        let (curated, manifest) =
            curate::curate_raw_key(&self.lake, &run_id, &raw.key, &self.config.curation).await?;
        report.curation_stats = Some(curated.stats.clone());
        report.curated_generation = Some(manifest.generation);

        report.transition(RunState::Aggregating)?;
        let dataset = aggregate::aggregate(&curated)?;
        let manifest = aggregate::publish(&self.lake, &run_id, &dataset).await?;
        report.aggregate = Some(AggregateCounts::of(&dataset));
        report.analytical_generation = Some(manifest.generation);

        report.transition(RunState::Done)
    }

    /// Extraction alone, under the run lock
    pub async fn run_extract(&self) -> Result<RawBatchRef> {
        let run_id = RunId::now();
        let guard = self.lake.run_lock().acquire(&run_id).await?;
        let result = self.extractor.extract_to_lake(&self.lake, &run_id).await;
        self.release(guard).await;
        result
    }

    /// Curate an existing raw batch, under the run lock
    pub async fn run_curate(&self, raw_key: &str) -> Result<(CurationStats, LayerManifest)> {
        let run_id = RunId::now();
        let guard = self.lake.run_lock().acquire(&run_id).await?;
        let result =
            curate::curate_raw_key(&self.lake, &run_id, raw_key, &self.config.curation).await;
        self.release(guard).await;
        result.map(|(dataset, manifest)| (dataset.stats, manifest))
    }

    /// Aggregate the current curated generation, under the run lock
    pub async fn run_aggregate(&self) -> Result<(AggregateCounts, LayerManifest)> {
        let run_id = RunId::now();
        let guard = self.lake.run_lock().acquire(&run_id).await?;
        let result = self.aggregate_current(&run_id).await;
        self.release(guard).await;
        result
    }

    async fn aggregate_current(&self, run_id: &RunId) -> Result<(AggregateCounts, LayerManifest)> {
        let (curated, _) = curate::load_current(&self.lake).await?;
        let dataset = aggregate::aggregate(&curated)?;
        let manifest = aggregate::publish(&self.lake, run_id, &dataset).await?;
        Ok((AggregateCounts::of(&dataset), manifest))
    }

    pub async fn status(&self) -> Result<LakeStatus> {
        Ok(LakeStatus {
            location: self.lake.store().describe(),
            latest_raw_key: self.lake.latest_raw_key().await?,
            curated: self.lake.current(Layer::Curated).await?,
            analytical: self.lake.current(Layer::Analytical).await?,
            lock: self.lake.run_lock().holder().await?,
        })
    }

    /// Stored report of an earlier run
    pub async fn report(&self, run_id: &RunId) -> Result<Option<RunReport>> {
        let key = self.lake.layout().run_report_key(run_id);
        match self.lake.store().get(&key).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    async fn release(&self, guard: LockGuard) {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release run lock");
        }
    }

    /// Store the run report. A failed run never replaces an existing report.
    async fn persist_report(&self, report: &RunReport) {
        let key = self.lake.layout().run_report_key(&report.run_id);
        let body = match serde_json::to_vec_pretty(report) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize run report");
                return;
            },
        };

        let store = self.lake.store();
        let written = if report.state == RunState::Done {
            store.put(&key, body, Some(JSON_CONTENT_TYPE)).await.map(Some)
        } else {
            store.put_if_absent(&key, body, Some(JSON_CONTENT_TYPE)).await
        };
        match written {
            Ok(Some(_)) => {},
            Ok(None) => warn!(key = %key, "Run report already exists, keeping it"),
            Err(e) => warn!(key = %key, error = %format!("{e:#}"), "Failed to persist run report"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport::new("20240101_000000".parse().unwrap())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut report = report();
        for next in [
            RunState::Extracting,
            RunState::Curating,
            RunState::Aggregating,
            RunState::Done,
        ] {
            report.transition(next).unwrap();
        }
        assert_eq!(report.state, RunState::Done);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut report = report();
        let err = report.transition(RunState::Curating).unwrap_err();
        match err {
            EtlError::InvalidTransition { from, to } => {
                assert_eq!(from, "PENDING");
                assert_eq!(to, "CURATING");
            },
            other => panic!("unexpected error: {other}"),
        }

        report.transition(RunState::Failed).unwrap();
        assert!(report.transition(RunState::Failed).is_err());
        assert!(report.transition(RunState::Extracting).is_err());
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        use RunState::*;
        for state in [Pending, Extracting, Curating, Aggregating] {
            assert!(state.can_transition_to(Failed), "{state}");
        }
        assert!(!Done.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Pending));
    }

    #[test]
    fn test_fail_records_stage_and_stats() {
        let mut report = report();
        report.transition(RunState::Extracting).unwrap();
        report.transition(RunState::Curating).unwrap();

        let err = EtlError::ExcessiveInvalidRate {
            stats: Box::new(CurationStats {
                input_records: 10,
                skipped_invalid: 6,
                ..Default::default()
            }),
            min_valid_fraction: 0.5,
        };
        report.fail(&err);

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.failed_stage, Some(Stage::Curate));
        assert_eq!(report.curation_stats.unwrap().skipped_invalid, 6);
        assert!(report.error.unwrap().contains("4 of 10"));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RunState::Aggregating).unwrap(), "\"AGGREGATING\"");
    }
}
