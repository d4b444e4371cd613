//! Curation: raw batch into typed, deduplicated, partitioned records
//!
//! Curation is a pure function of the raw batch. The same batch always gives
//! the same partitions in the same order with the same bytes, which is what
//! makes a re-run idempotent.

pub mod normalize;

use std::collections::BTreeMap;

use brewlake_common::RunId;
use tracing::{error, info, instrument, warn};

pub use normalize::{normalize, Normalized};

use crate::columnar::{self, PARQUET_CONTENT_TYPE};
use crate::config::CurationPolicy;
use crate::error::{EtlError, Result};
use crate::lake::layout::{self, Layer};
use crate::lake::publish::{Publication, StagedObject};
use crate::lake::{Lake, LayerManifest};
use crate::models::{
    BreweryType, CuratedDataset, CuratedRecord, CurationStats, PartitionKey, RawBatch, UNKNOWN,
};

/// Validate, normalise and deduplicate a raw batch.
///
/// The last record seen for an identifier wins. Fails with
/// `ExcessiveInvalidRate` when too few records carry a usable identifier.
#[instrument(skip(batch, policy), fields(run_id = %batch.run_id, records = batch.records.len()))]
pub fn curate(batch: &RawBatch, policy: &CurationPolicy) -> Result<CuratedDataset> {
    let mut stats = CurationStats {
        input_records: batch.records.len() as u64,
        ..Default::default()
    };

    let mut by_id: BTreeMap<String, Normalized> = BTreeMap::new();
    for raw in &batch.records {
        match normalize(raw.get(), &batch.run_id) {
            Some(normalized) => {
                if by_id.insert(normalized.record.id.clone(), normalized).is_some() {
                    stats.duplicates_dropped += 1;
                }
            },
            None => stats.skipped_invalid += 1,
        }
    }

    if stats.valid_fraction() < policy.min_valid_fraction {
        warn!(
            valid = stats.valid_records(),
            total = stats.input_records,
            min_valid_fraction = policy.min_valid_fraction,
            "Raw batch rejected, too many invalid records"
        );
        return Err(EtlError::ExcessiveInvalidRate {
            stats: Box::new(stats),
            min_valid_fraction: policy.min_valid_fraction,
        });
    }

    let mut partitions: BTreeMap<PartitionKey, Vec<CuratedRecord>> = BTreeMap::new();
    for normalized in by_id.into_values() {
        tally(&mut stats, &normalized);
        let record = normalized.record;
        partitions.entry(record.partition()).or_default().push(record);
    }

    stats.curated_records = partitions.values().map(|p| p.len() as u64).sum();
    stats.partitions = partitions.len() as u64;

    info!(
        curated = stats.curated_records,
        partitions = stats.partitions,
        skipped_invalid = stats.skipped_invalid,
        duplicates_dropped = stats.duplicates_dropped,
        "Curated raw batch"
    );

    Ok(CuratedDataset {
        source_run: batch.run_id.clone(),
        partitions,
        stats,
    })
}

fn tally(stats: &mut CurationStats, normalized: &Normalized) {
    let record = &normalized.record;
    stats.unknown_type += u64::from(record.brewery_type == BreweryType::Unknown);
    stats.unknown_country += u64::from(record.country == UNKNOWN);
    stats.unknown_state += u64::from(record.state == UNKNOWN);
    stats.unknown_city += u64::from(record.city == UNKNOWN);
    stats.latitude_nulled += u64::from(normalized.latitude_nulled);
    stats.longitude_nulled += u64::from(normalized.longitude_nulled);
}

/// One Parquet object per partition, records in id order
pub fn partition_objects(dataset: &CuratedDataset) -> Result<Vec<StagedObject>> {
    dataset
        .partitions
        .iter()
        .map(|(partition, records)| {
            Ok(StagedObject {
                relative_key: layout::partition_path(partition),
                partition: Some(partition.to_string()),
                record_count: records.len() as u64,
                content_type: PARQUET_CONTENT_TYPE,
                body: columnar::encode_curated(records)?,
            })
        })
        .collect()
}

/// Publish a dataset as the new curated generation
pub async fn publish(lake: &Lake, run_id: &RunId, dataset: &CuratedDataset) -> Result<LayerManifest> {
    let objects = partition_objects(dataset)?;
    lake.publisher()
        .publish(
            Publication {
                layer: Layer::Curated,
                run_id: run_id.clone(),
                source_run: dataset.source_run.clone(),
                metadata: serde_json::to_value(&dataset.stats)?,
            },
            objects,
        )
        .await
}

/// Curate the raw batch at `raw_key` and publish it
#[instrument(skip(lake, policy))]
pub async fn curate_raw_key(
    lake: &Lake,
    run_id: &RunId,
    raw_key: &str,
    policy: &CurationPolicy,
) -> Result<(CuratedDataset, LayerManifest)> {
    let batch = lake.read_raw_batch(raw_key).await?;
    let dataset = curate(&batch, policy)?;
    let manifest = publish(lake, run_id, &dataset).await?;
    Ok((dataset, manifest))
}

/// Rebuild the dataset of the currently published curated generation
pub async fn load_current(lake: &Lake) -> Result<(CuratedDataset, LayerManifest)> {
    let manifest = lake.require_current(Layer::Curated).await?;
    let mut partitions = BTreeMap::new();

    for entry in &manifest.objects {
        let partition = layout::parse_partition_path(&entry.key)
            .ok_or_else(|| EtlError::NotFound(format!("partition path in {}", entry.key)))?;
        let body = lake.publisher().read_object(entry).await?;
        partitions.insert(partition, columnar::decode_curated(body)?);
    }

    let stats = serde_json::from_value(manifest.metadata.clone()).map_err(|e| {
        error!(
            generation = %manifest.generation,
            error = %e,
            "Curated manifest carries unreadable curation stats"
        );
        EtlError::Json(e)
    })?;
    let dataset = CuratedDataset {
        source_run: manifest.source_run.clone(),
        partitions,
        stats,
    };
    Ok((dataset, manifest))
}
