//! End-to-end runs of the coordinator against a mocked upstream

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use brewlake_common::RunId;
use brewlake_etl::aggregate::{self, COUNTRY_TOTALS};
use brewlake_etl::curate;
use brewlake_etl::lake::{Layer, LockInfo};
use brewlake_etl::models::{AggregateRecord, BreweryType, CountryTotals, CuratedRecord, UNKNOWN};
use brewlake_etl::storage::ObjectStore;
use brewlake_etl::{EtlError, RunCoordinator, RunState, Stage};
use chrono::{Duration, Utc};
use common::{breweries, brewery, config, init_tracing, mount_pages, FailingStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::MockServer;

fn run(id: &str) -> RunId {
    id.parse().unwrap()
}

async fn setup(
    server: &MockServer,
    dir: &TempDir,
    page_size: usize,
) -> (RunCoordinator, Arc<FailingStore>) {
    let store = FailingStore::new(dir);
    let coordinator =
        RunCoordinator::new(config(server, dir, page_size), store.clone() as Arc<dyn ObjectStore>)
            .unwrap();
    (coordinator, store)
}

fn scenario() -> Vec<Value> {
    vec![
        brewery("1", "micro", json!("United States"), json!("California")),
        brewery("1", "bogus", json!("united states"), json!("California")),
        brewery("2", "large", Value::Null, Value::Null),
    ]
}

async fn current_object(coordinator: &RunCoordinator, layer: Layer, name: &str) -> Vec<u8> {
    let lake = coordinator.lake();
    let manifest = lake.require_current(layer).await.unwrap();
    let entry = manifest.entry(name).unwrap();
    lake.publisher().read_object(entry).await.unwrap()
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[scenario()]).await;

    let (coordinator, _) = setup(&server, &dir, 10).await;
    let report = coordinator.run_with_id(run("20240315_120000")).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.raw_records, Some(3));
    let stats = report.curation_stats.as_ref().unwrap();
    assert_eq!(stats.input_records, 3);
    assert_eq!(stats.duplicates_dropped, 1);
    assert_eq!(stats.unknown_type, 1);
    assert_eq!(stats.unknown_country, 1);
    assert_eq!(stats.curated_records, 2);

    let (curated, _) = curate::load_current(coordinator.lake()).await.unwrap();
    let one = curated.get("1").unwrap();
    assert_eq!(one.brewery_type, BreweryType::Unknown);
    assert_eq!(one.country, "united states");
    assert_eq!(one.state, "California");
    assert_eq!(one.date_request, run("20240315_120000"));
    let two = curated.get("2").unwrap();
    assert_eq!(two.brewery_type, BreweryType::Large);
    assert_eq!(two.country, UNKNOWN);
    assert_eq!(two.state, UNKNOWN);

    let totals: CountryTotals = serde_json::from_slice(
        &current_object(&coordinator, Layer::Analytical, COUNTRY_TOTALS).await,
    )
    .unwrap();
    assert_eq!(totals.total_for("united states"), Some(1));
    assert_eq!(totals.total_for("United States"), None);
    assert_eq!(totals.unknown_country, 1);

    let (analytical, _) = aggregate::load_current(coordinator.lake()).await.unwrap();
    assert_eq!(
        analytical.records,
        vec![AggregateRecord {
            country: "united states".to_string(),
            state: "California".to_string(),
            brewery_type: BreweryType::Unknown,
            count: 1,
        }]
    );
    assert_eq!(analytical.locations.len(), 2);
    assert_eq!(analytical.source_run, run("20240315_120000"));

    let stored = coordinator.report(&report.run_id).await.unwrap().unwrap();
    assert_eq!(stored, report);
    assert!(coordinator.status().await.unwrap().lock.is_none());
}

#[tokio::test]
async fn test_recuration_is_byte_identical() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut records = breweries("a", 4);
    records.extend(scenario());
    mount_pages(&server, 50, &[records]).await;

    let (coordinator, _) = setup(&server, &dir, 50).await;
    let raw = coordinator.run_extract().await.unwrap();

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        coordinator.run_curate(&raw.key).await.unwrap();
        coordinator.run_aggregate().await.unwrap();

        let lake = coordinator.lake();
        let mut bodies = Vec::new();
        for layer in [Layer::Curated, Layer::Analytical] {
            let manifest = lake.require_current(layer).await.unwrap();
            for entry in &manifest.objects {
                let relative = entry
                    .key
                    .trim_start_matches(&lake.layout().generation_prefix(layer, &manifest.generation))
                    .to_string();
                bodies.push((relative, lake.publisher().read_object(entry).await.unwrap()));
            }
        }
        snapshots.push(bodies);
    }

    assert!(!snapshots[0].is_empty());
    assert_eq!(snapshots[0], snapshots[1]);
}

#[tokio::test]
async fn test_out_of_range_latitude_is_nulled_not_dropped() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut record = brewery("geo", "micro", json!("Ireland"), json!("Dublin"));
    record["latitude"] = json!(999);
    mount_pages(&server, 10, &[vec![record]]).await;

    let (coordinator, _) = setup(&server, &dir, 10).await;
    let report = coordinator.run_with_id(run("20240315_120000")).await.unwrap();
    assert_eq!(report.curation_stats.unwrap().latitude_nulled, 1);

    let (curated, _) = curate::load_current(coordinator.lake()).await.unwrap();
    let kept: &CuratedRecord = curated.get("geo").unwrap();
    assert_eq!(kept.latitude, None);
    assert_eq!(kept.longitude, Some(-89.65));
}

#[tokio::test]
async fn test_excessive_invalid_rate_keeps_previous_curated_layer() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[breweries("good", 3)]).await;

    let (coordinator, _) = setup(&server, &dir, 10).await;
    coordinator.run_with_id(run("20240315_120000")).await.unwrap();
    let before = coordinator.lake().current(Layer::Curated).await.unwrap();

    // 6 of 10 records have no id
    let mut records: Vec<Value> = (0..6).map(|i| json!({"name": format!("anon {i}")})).collect();
    records.extend(breweries("next", 4));
    let second = MockServer::start().await;
    mount_pages(&second, 10, &[records, Vec::new()]).await;

    let (retry, _) = setup(&second, &dir, 10).await;
    let err = retry.run_with_id(run("20240316_120000")).await.unwrap_err();

    assert!(matches!(err.source, EtlError::ExcessiveInvalidRate { .. }));
    assert_eq!(err.report.state, RunState::Failed);
    assert_eq!(err.report.failed_stage, Some(Stage::Curate));
    let stats = err.report.curation_stats.as_ref().unwrap();
    assert_eq!(stats.skipped_invalid, 6);
    assert_eq!(stats.input_records, 10);

    // raw batch of the failed run stays in place
    assert!(err.report.raw_key.is_some());
    assert_eq!(retry.lake().current(Layer::Curated).await.unwrap(), before);

    let stored = retry.report(&run("20240316_120000")).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
}

#[tokio::test]
async fn test_partition_write_failure_keeps_previous_generation() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 50, &[scenario()]).await;

    let (coordinator, store) = setup(&server, &dir, 50).await;
    let raw = coordinator.run_extract().await.unwrap();
    let (_, first) = coordinator.run_curate(&raw.key).await.unwrap();

    store.fail_writes_containing("country=unknown");
    let err = coordinator.run_curate(&raw.key).await.unwrap_err();
    match &err {
        EtlError::PartitionWriteFailure { layer, partition, .. } => {
            assert_eq!(layer, "curated");
            assert_eq!(partition, "unknown/unknown");
        },
        other => panic!("unexpected error: {other}"),
    }

    let current = coordinator.lake().current(Layer::Curated).await.unwrap().unwrap();
    assert_eq!(current, first);

    // only the committed generation remains staged
    let prefix = coordinator.lake().layout().generations_prefix(Layer::Curated);
    let keys = store.list(&prefix).await.unwrap();
    assert!(keys.iter().all(|k| k.contains(&first.generation)));

    store.heal();
    let (_, healed) = coordinator.run_curate(&raw.key).await.unwrap();
    assert_ne!(healed.generation, first.generation);
}

#[tokio::test]
async fn test_commit_failure_keeps_previous_manifest() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 50, &[scenario()]).await;

    let (coordinator, store) = setup(&server, &dir, 50).await;
    coordinator.run_with_id(run("20240315_120000")).await.unwrap();
    let before = coordinator.lake().current(Layer::Analytical).await.unwrap().unwrap();

    store.fail_writes_containing("analytical/_CURRENT.json");
    let err = coordinator.run_aggregate().await.unwrap_err();
    assert!(matches!(err, EtlError::PartitionWriteFailure { .. }));
    store.heal();

    let after = coordinator.lake().current(Layer::Analytical).await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_held_lock_rejects_second_run() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[breweries("a", 1)]).await;

    let (coordinator, store) = setup(&server, &dir, 10).await;
    let holder = LockInfo {
        run_id: run("20240315_110000"),
        host: "other-host".to_string(),
        acquired_at: Utc::now(),
    };
    store
        .put("_locks/brewlake.lock", serde_json::to_vec(&holder).unwrap(), None)
        .await
        .unwrap();

    let err = coordinator.run_with_id(run("20240315_120000")).await.unwrap_err();
    match &err.source {
        EtlError::RunLocked { holder, .. } => assert_eq!(holder, "20240315_110000"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.report.state, RunState::Failed);
    assert_eq!(err.report.failed_stage, None);
    assert!(err.report.raw_key.is_none());
    assert!(store.list("raw/").await.unwrap().is_empty());

    assert!(matches!(coordinator.run_extract().await, Err(EtlError::RunLocked { .. })));
    assert!(coordinator.report(&run("20240315_120000")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_repeated_run_id_keeps_first_report() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[breweries("a", 2)]).await;

    let (coordinator, store) = setup(&server, &dir, 10).await;
    let first = coordinator.run_with_id(run("20240315_120000")).await.unwrap();

    let err = coordinator.run_with_id(run("20240315_120000")).await.unwrap_err();
    assert!(matches!(err.source, EtlError::RawBatchExists(_)));
    assert_eq!(coordinator.report(&first.run_id).await.unwrap().unwrap(), first);

    // a second invocation blocked by a live lock leaves the record alone too
    let holder = LockInfo {
        run_id: run("20240315_120000"),
        host: "other-host".to_string(),
        acquired_at: Utc::now(),
    };
    store
        .put("_locks/brewlake.lock", serde_json::to_vec(&holder).unwrap(), None)
        .await
        .unwrap();
    let err = coordinator.run_with_id(run("20240315_120000")).await.unwrap_err();
    assert!(matches!(err.source, EtlError::RunLocked { .. }));
    assert_eq!(coordinator.report(&first.run_id).await.unwrap().unwrap(), first);
}

#[tokio::test]
async fn test_stale_lock_is_broken() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[breweries("a", 1)]).await;

    let (coordinator, store) = setup(&server, &dir, 10).await;
    let abandoned = LockInfo {
        run_id: run("20240301_000000"),
        host: "crashed-host".to_string(),
        acquired_at: Utc::now() - Duration::hours(7),
    };
    store
        .put("_locks/brewlake.lock", serde_json::to_vec(&abandoned).unwrap(), None)
        .await
        .unwrap();

    let report = coordinator.run_with_id(run("20240315_120000")).await.unwrap();
    assert_eq!(report.state, RunState::Done);
    assert!(!store.exists("_locks/brewlake.lock").await.unwrap());
}

#[tokio::test]
async fn test_aggregate_without_curated_layer_fails() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let (coordinator, _) = setup(&server, &dir, 10).await;
    assert!(matches!(coordinator.run_aggregate().await, Err(EtlError::LayerEmpty(_))));
    assert!(matches!(
        coordinator.run_curate("raw/date_request=20240101_000000/breweries.json").await,
        Err(EtlError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_empty_upstream_publishes_empty_layers() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_pages(&server, 10, &[Vec::new()]).await;

    let (coordinator, _) = setup(&server, &dir, 10).await;
    let report = coordinator.run_with_id(run("20240315_120000")).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.raw_records, Some(0));
    let curated = coordinator.lake().require_current(Layer::Curated).await.unwrap();
    assert!(curated.objects.is_empty());

    let totals: CountryTotals = serde_json::from_slice(
        &current_object(&coordinator, Layer::Analytical, COUNTRY_TOTALS).await,
    )
    .unwrap();
    assert_eq!(totals, CountryTotals::default());
}
