//! Aggregation: curated dataset into analytical summaries
//!
//! Produces three objects per generation:
//!
//! - `by_location_type.parquet`: brewery count per (country, state, type)
//! - `country_totals.json`: per-country totals plus the unknown-country bucket
//! - `location_summary.parquet`: one row per partition with a column per type

use std::collections::BTreeMap;

use brewlake_common::RunId;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::columnar::{self, PARQUET_CONTENT_TYPE};
use crate::error::{EtlError, Result};
use crate::lake::layout::Layer;
use crate::lake::publish::{Publication, StagedObject, JSON_CONTENT_TYPE};
use crate::lake::{Lake, LayerManifest};
use crate::models::{
    AggregateDataset, AggregateRecord, BreweryType, CountryTotal, CountryTotals, CuratedDataset,
    LocationSummary,
};

pub const BY_LOCATION_TYPE: &str = "by_location_type.parquet";
pub const COUNTRY_TOTALS: &str = "country_totals.json";
pub const LOCATION_SUMMARY: &str = "location_summary.parquet";

/// Row counts recorded in the analytical manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub aggregate_rows: u64,
    pub countries: u64,
    pub locations: u64,
    pub known_country_records: u64,
    pub unknown_country_records: u64,
}

impl AggregateCounts {
    pub fn of(dataset: &AggregateDataset) -> Self {
        Self {
            aggregate_rows: dataset.records.len() as u64,
            countries: dataset.totals.countries.len() as u64,
            locations: dataset.locations.len() as u64,
            known_country_records: dataset.totals.known_total(),
            unknown_country_records: dataset.totals.unknown_country,
        }
    }
}

#[instrument(skip(curated), fields(source_run = %curated.source_run, records = curated.len()))]
pub fn aggregate(curated: &CuratedDataset) -> Result<AggregateDataset> {
    let mut groups: BTreeMap<(&str, &str, BreweryType), u64> = BTreeMap::new();
    let mut countries: BTreeMap<&str, u64> = BTreeMap::new();
    let mut unknown_country = 0u64;

    for record in curated.records() {
        if !record.has_known_country() {
            unknown_country += 1;
            continue;
        }
        *groups
            .entry((record.country.as_str(), record.state.as_str(), record.brewery_type))
            .or_default() += 1;
        *countries.entry(record.country.as_str()).or_default() += 1;
    }

    let records: Vec<AggregateRecord> = groups
        .into_iter()
        .map(|((country, state, brewery_type), count)| AggregateRecord {
            country: country.to_string(),
            state: state.to_string(),
            brewery_type,
            count,
        })
        .collect();

    let totals = CountryTotals {
        countries: countries
            .into_iter()
            .map(|(country, total)| CountryTotal {
                country: country.to_string(),
                total,
            })
            .collect(),
        unknown_country,
    };

    let locations = curated
        .partitions
        .iter()
        .map(|(partition, rows)| {
            let mut by_type: BTreeMap<String, u64> = BreweryType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), 0))
                .collect();
            for row in rows {
                *by_type.entry(row.brewery_type.as_str().to_string()).or_default() += 1;
            }
            LocationSummary {
                location: partition.location(),
                country: partition.country.clone(),
                state: partition.state.clone(),
                by_type,
                total: rows.len() as u64,
            }
        })
        .collect();

    let dataset = AggregateDataset {
        source_run: curated.source_run.clone(),
        records,
        totals,
        locations,
    };
    verify(curated, &dataset)?;

    info!(
        aggregate_rows = dataset.records.len(),
        countries = dataset.totals.countries.len(),
        unknown_country = dataset.totals.unknown_country,
        "Aggregated curated dataset"
    );
    Ok(dataset)
}

/// Check the aggregate against the curated input it came from
pub fn verify(curated: &CuratedDataset, dataset: &AggregateDataset) -> Result<()> {
    let known = curated.known_country_count();
    let total = curated.len() as u64;
    let location_total: u64 = dataset.locations.iter().map(|l| l.total).sum();

    let checks = [
        ("aggregate record counts", known, dataset.record_count_sum()),
        ("country totals", known, dataset.totals.known_total()),
        ("known plus unknown country", total, known + dataset.totals.unknown_country),
        ("location summary totals", total, location_total),
    ];

    for (check, expected, actual) in checks {
        if expected != actual {
            error!(check, expected, actual, "Aggregation invariant violated");
            return Err(EtlError::AggregationInconsistency {
                check,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Serialise the three analytical objects
pub fn analytical_objects(dataset: &AggregateDataset) -> Result<Vec<StagedObject>> {
    Ok(vec![
        StagedObject {
            relative_key: BY_LOCATION_TYPE.to_string(),
            partition: None,
            record_count: dataset.records.len() as u64,
            content_type: PARQUET_CONTENT_TYPE,
            body: columnar::encode_by_location_type(&dataset.records)?,
        },
        StagedObject {
            relative_key: COUNTRY_TOTALS.to_string(),
            partition: None,
            record_count: dataset.totals.countries.len() as u64,
            content_type: JSON_CONTENT_TYPE,
            body: serde_json::to_vec_pretty(&dataset.totals)?,
        },
        StagedObject {
            relative_key: LOCATION_SUMMARY.to_string(),
            partition: None,
            record_count: dataset.locations.len() as u64,
            content_type: PARQUET_CONTENT_TYPE,
            body: columnar::encode_location_summary(&dataset.source_run, &dataset.locations)?,
        },
    ])
}

pub async fn publish(
    lake: &Lake,
    run_id: &RunId,
    dataset: &AggregateDataset,
) -> Result<LayerManifest> {
    let objects = analytical_objects(dataset)?;
    lake.publisher()
        .publish(
            Publication {
                layer: Layer::Analytical,
                run_id: run_id.clone(),
                source_run: dataset.source_run.clone(),
                metadata: serde_json::to_value(AggregateCounts::of(dataset))?,
            },
            objects,
        )
        .await
}

async fn read_table(lake: &Lake, manifest: &LayerManifest, name: &str) -> Result<Vec<u8>> {
    let entry = manifest
        .entry(name)
        .ok_or_else(|| EtlError::NotFound(format!("{name} in generation {}", manifest.generation)))?;
    lake.publisher().read_object(entry).await
}

/// Read the currently published analytical generation back
pub async fn load_current(lake: &Lake) -> Result<(AggregateDataset, LayerManifest)> {
    let manifest = lake.require_current(Layer::Analytical).await?;

    let records =
        columnar::decode_by_location_type(read_table(lake, &manifest, BY_LOCATION_TYPE).await?)?;
    let totals = serde_json::from_slice(&read_table(lake, &manifest, COUNTRY_TOTALS).await?)?;
    let locations =
        columnar::decode_location_summary(read_table(lake, &manifest, LOCATION_SUMMARY).await?)?;

    let dataset = AggregateDataset {
        source_run: manifest.source_run.clone(),
        records,
        totals,
        locations,
    };
    Ok((dataset, manifest))
}
