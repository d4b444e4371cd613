//! Parquet encoding of the curated and analytical tables
//!
//! Every table is one Parquet file holding a single record batch. Writer
//! properties are fixed, including `created_by`, so the same rows in the same
//! order always encode to the same bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, UInt64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use brewlake_common::RunId;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::{EtlError, Result};
use crate::models::{AggregateRecord, BreweryType, CuratedRecord, LocationSummary};

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

const CREATED_BY: &str = "brewlake";

/// Column of the location summary holding the count of one brewery type
pub fn type_column(brewery_type: BreweryType) -> String {
    format!("tot_{}", brewery_type.as_str())
}

pub fn curated_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("brewery_type", DataType::Utf8, false),
        Field::new("street", DataType::Utf8, true),
        Field::new("address_2", DataType::Utf8, true),
        Field::new("address_3", DataType::Utf8, true),
        Field::new("city", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("postal_code", DataType::Utf8, true),
        Field::new("country", DataType::Utf8, false),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("phone", DataType::Utf8, true),
        Field::new("website_url", DataType::Utf8, true),
        Field::new("date_request", DataType::Utf8, false),
    ])
}

pub fn by_location_type_schema() -> Schema {
    Schema::new(vec![
        Field::new("country", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("brewery_type", DataType::Utf8, false),
        Field::new("count", DataType::UInt64, false),
    ])
}

/// One row per location, a `tot_<type>` column per brewery type and the
/// location total in `tot_brewery`
pub fn location_summary_schema() -> Schema {
    let mut fields = vec![
        Field::new("date_request", DataType::Utf8, false),
        Field::new("location", DataType::Utf8, false),
        Field::new("country", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
    ];
    fields.extend(
        BreweryType::ALL
            .iter()
            .map(|t| Field::new(type_column(*t), DataType::UInt64, false)),
    );
    fields.push(Field::new("tot_brewery", DataType::UInt64, false));
    Schema::new(fields)
}

// ============================================================================
// Encoding
// ============================================================================

fn text<S: AsRef<str>>(values: impl Iterator<Item = S>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}

fn nullable_text<S: AsRef<str>>(values: impl Iterator<Item = Option<S>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

fn counts(values: impl Iterator<Item = u64>) -> ArrayRef {
    Arc::new(UInt64Array::from_iter_values(values))
}

fn write_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by(CREATED_BY.to_string())
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

/// Encode one curated partition, rows in the order given
pub fn encode_curated(records: &[CuratedRecord]) -> Result<Vec<u8>> {
    let rows = || records.iter();
    let columns = vec![
        text(rows().map(|r| r.id.as_str())),
        nullable_text(rows().map(|r| r.name.as_deref())),
        text(rows().map(|r| r.brewery_type.as_str())),
        nullable_text(rows().map(|r| r.street.as_deref())),
        nullable_text(rows().map(|r| r.address_2.as_deref())),
        nullable_text(rows().map(|r| r.address_3.as_deref())),
        text(rows().map(|r| r.city.as_str())),
        text(rows().map(|r| r.state.as_str())),
        nullable_text(rows().map(|r| r.postal_code.as_deref())),
        text(rows().map(|r| r.country.as_str())),
        Arc::new(rows().map(|r| r.latitude).collect::<Float64Array>()) as ArrayRef,
        Arc::new(rows().map(|r| r.longitude).collect::<Float64Array>()) as ArrayRef,
        nullable_text(rows().map(|r| r.phone.as_deref())),
        nullable_text(rows().map(|r| r.website_url.as_deref())),
        text(rows().map(|r| r.date_request.as_str())),
    ];
    let batch = RecordBatch::try_new(Arc::new(curated_schema()), columns)?;
    write_parquet(&batch)
}

pub fn encode_by_location_type(records: &[AggregateRecord]) -> Result<Vec<u8>> {
    let rows = || records.iter();
    let columns = vec![
        text(rows().map(|r| r.country.as_str())),
        text(rows().map(|r| r.state.as_str())),
        text(rows().map(|r| r.brewery_type.as_str())),
        counts(rows().map(|r| r.count)),
    ];
    let batch = RecordBatch::try_new(Arc::new(by_location_type_schema()), columns)?;
    write_parquet(&batch)
}

pub fn encode_location_summary(
    source_run: &RunId,
    locations: &[LocationSummary],
) -> Result<Vec<u8>> {
    let rows = || locations.iter();
    let mut columns = vec![
        text(rows().map(|_| source_run.as_str())),
        text(rows().map(|l| l.location.as_str())),
        text(rows().map(|l| l.country.as_str())),
        text(rows().map(|l| l.state.as_str())),
    ];
    for brewery_type in BreweryType::ALL {
        columns.push(counts(
            rows().map(|l| l.by_type.get(brewery_type.as_str()).copied().unwrap_or(0)),
        ));
    }
    columns.push(counts(rows().map(|l| l.total)));

    let batch = RecordBatch::try_new(Arc::new(location_summary_schema()), columns)?;
    write_parquet(&batch)
}

// ============================================================================
// Decoding
// ============================================================================

fn read_parquet(body: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(body))?.build()?;
    Ok(reader.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn missing_column(name: &str, kind: &str) -> EtlError {
    ArrowError::SchemaError(format!("expected {kind} column '{name}'")).into()
}

fn strings<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_string_opt::<i32>())
        .ok_or_else(|| missing_column(name, "Utf8"))
}

fn floats<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_primitive_opt::<Float64Type>())
        .ok_or_else(|| missing_column(name, "Float64"))
}

fn unsigned<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_primitive_opt::<UInt64Type>())
        .ok_or_else(|| missing_column(name, "UInt64"))
}

fn optional_text(column: &StringArray, row: usize) -> Option<String> {
    column.is_valid(row).then(|| column.value(row).to_string())
}

fn optional_float(column: &Float64Array, row: usize) -> Option<f64> {
    column.is_valid(row).then(|| column.value(row))
}

pub fn decode_curated(body: Vec<u8>) -> Result<Vec<CuratedRecord>> {
    let mut records = Vec::new();
    for batch in read_parquet(body)? {
        let id = strings(&batch, "id")?;
        let name = strings(&batch, "name")?;
        let brewery_type = strings(&batch, "brewery_type")?;
        let street = strings(&batch, "street")?;
        let address_2 = strings(&batch, "address_2")?;
        let address_3 = strings(&batch, "address_3")?;
        let city = strings(&batch, "city")?;
        let state = strings(&batch, "state")?;
        let postal_code = strings(&batch, "postal_code")?;
        let country = strings(&batch, "country")?;
        let latitude = floats(&batch, "latitude")?;
        let longitude = floats(&batch, "longitude")?;
        let phone = strings(&batch, "phone")?;
        let website_url = strings(&batch, "website_url")?;
        let date_request = strings(&batch, "date_request")?;

        for row in 0..batch.num_rows() {
            records.push(CuratedRecord {
                id: id.value(row).to_string(),
                name: optional_text(name, row),
                brewery_type: BreweryType::from_raw(brewery_type.value(row)),
                street: optional_text(street, row),
                address_2: optional_text(address_2, row),
                address_3: optional_text(address_3, row),
                city: city.value(row).to_string(),
                state: state.value(row).to_string(),
                postal_code: optional_text(postal_code, row),
                country: country.value(row).to_string(),
                latitude: optional_float(latitude, row),
                longitude: optional_float(longitude, row),
                phone: optional_text(phone, row),
                website_url: optional_text(website_url, row),
                date_request: date_request.value(row).parse()?,
            });
        }
    }
    Ok(records)
}

pub fn decode_by_location_type(body: Vec<u8>) -> Result<Vec<AggregateRecord>> {
    let mut records = Vec::new();
    for batch in read_parquet(body)? {
        let country = strings(&batch, "country")?;
        let state = strings(&batch, "state")?;
        let brewery_type = strings(&batch, "brewery_type")?;
        let count = unsigned(&batch, "count")?;

        for row in 0..batch.num_rows() {
            records.push(AggregateRecord {
                country: country.value(row).to_string(),
                state: state.value(row).to_string(),
                brewery_type: BreweryType::from_raw(brewery_type.value(row)),
                count: count.value(row),
            });
        }
    }
    Ok(records)
}

pub fn decode_location_summary(body: Vec<u8>) -> Result<Vec<LocationSummary>> {
    let mut locations = Vec::new();
    for batch in read_parquet(body)? {
        let location = strings(&batch, "location")?;
        let country = strings(&batch, "country")?;
        let state = strings(&batch, "state")?;
        let total = unsigned(&batch, "tot_brewery")?;
        let per_type = BreweryType::ALL
            .iter()
            .map(|t| unsigned(&batch, &type_column(*t)).map(|column| (t.as_str(), column)))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let by_type: BTreeMap<String, u64> = per_type
                .iter()
                .map(|(name, column)| (name.to_string(), column.value(row)))
                .collect();
            locations.push(LocationSummary {
                location: location.value(row).to_string(),
                country: country.value(row).to_string(),
                state: state.value(row).to_string(),
                by_type,
                total: total.value(row),
            });
        }
    }
    Ok(locations)
}
