//! Records flowing through the three lake layers

use brewlake_common::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder for missing or blank geography fields
pub const UNKNOWN: &str = "unknown";

// ============================================================================
// Raw layer
// ============================================================================

/// One extraction run, exactly as received from upstream.
///
/// `records` holds every page body concatenated in page order. Each element
/// keeps its original JSON text so the raw layer never reorders or rewrites
/// upstream fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBatch {
    pub run_id: RunId,
    pub extracted_at: DateTime<Utc>,
    pub source_endpoint: String,
    pub page_size: usize,
    pub pages_fetched: usize,
    pub record_count: usize,
    pub records: Vec<Box<RawValue>>,
}

/// Where a raw batch landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatchRef {
    pub key: String,
    pub run_id: RunId,
    pub record_count: usize,
    pub sha256: String,
}

// ============================================================================
// Curated layer
// ============================================================================

/// Brewery classification used by Open Brewery DB
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreweryType {
    Micro,
    Nano,
    Regional,
    Brewpub,
    Large,
    Planning,
    Bar,
    Contract,
    Proprietor,
    Closed,
    Taproom,
    Unknown,
}

impl BreweryType {
    /// Every type a curated record can carry, `Unknown` last
    pub const ALL: [BreweryType; 12] = [
        BreweryType::Micro,
        BreweryType::Nano,
        BreweryType::Regional,
        BreweryType::Brewpub,
        BreweryType::Large,
        BreweryType::Planning,
        BreweryType::Bar,
        BreweryType::Contract,
        BreweryType::Proprietor,
        BreweryType::Closed,
        BreweryType::Taproom,
        BreweryType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BreweryType::Micro => "micro",
            BreweryType::Nano => "nano",
            BreweryType::Regional => "regional",
            BreweryType::Brewpub => "brewpub",
            BreweryType::Large => "large",
            BreweryType::Planning => "planning",
            BreweryType::Bar => "bar",
            BreweryType::Contract => "contract",
            BreweryType::Proprietor => "proprietor",
            BreweryType::Closed => "closed",
            BreweryType::Taproom => "taproom",
            BreweryType::Unknown => "unknown",
        }
    }

    /// Case-insensitive match against the enumerated set; anything else is `Unknown`
    pub fn from_raw(value: &str) -> Self {
        let needle = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .unwrap_or(BreweryType::Unknown)
    }
}

impl fmt::Display for BreweryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geography key of a curated partition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub country: String,
    pub state: String,
}

impl PartitionKey {
    pub fn new(country: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            state: state.into(),
        }
    }

    /// `Country-State` label used by the location summary
    pub fn location(&self) -> String {
        format!("{}-{}", self.country, self.state)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country, self.state)
    }
}

/// Normalised brewery row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedRecord {
    pub id: String,
    pub name: Option<String>,
    pub brewery_type: BreweryType,
    pub street: Option<String>,
    pub address_2: Option<String>,
    pub address_3: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: Option<String>,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub website_url: Option<String>,
    /// Run id of the raw batch this row was curated from
    pub date_request: RunId,
}

impl CuratedRecord {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(&self.country, &self.state)
    }

    pub fn has_known_country(&self) -> bool {
        self.country != UNKNOWN
    }
}

/// Record-level defects recovered during curation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationStats {
    pub input_records: u64,
    pub skipped_invalid: u64,
    pub duplicates_dropped: u64,
    pub unknown_type: u64,
    pub unknown_country: u64,
    pub unknown_state: u64,
    pub unknown_city: u64,
    pub latitude_nulled: u64,
    pub longitude_nulled: u64,
    pub curated_records: u64,
    pub partitions: u64,
}

impl CurationStats {
    /// Records that passed identifier validation, duplicates included
    pub fn valid_records(&self) -> u64 {
        self.input_records.saturating_sub(self.skipped_invalid)
    }

    /// Share of input that passed validation; an empty batch counts as clean
    pub fn valid_fraction(&self) -> f64 {
        if self.input_records == 0 {
            return 1.0;
        }
        self.valid_records() as f64 / self.input_records as f64
    }
}

/// Result of one curation run, grouped by partition
#[derive(Debug, Clone, PartialEq)]
pub struct CuratedDataset {
    pub source_run: RunId,
    /// Records per partition, each list sorted by id
    pub partitions: BTreeMap<PartitionKey, Vec<CuratedRecord>>,
    pub stats: CurationStats,
}

impl CuratedDataset {
    /// All records in partition order, then id order
    pub fn records(&self) -> impl Iterator<Item = &CuratedRecord> {
        self.partitions.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn known_country_count(&self) -> u64 {
        self.records().filter(|r| r.has_known_country()).count() as u64
    }

    pub fn get(&self, id: &str) -> Option<&CuratedRecord> {
        self.records().find(|r| r.id == id)
    }
}

// ============================================================================
// Analytical layer
// ============================================================================

/// Breweries of one type in one state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub country: String,
    pub state: String,
    pub brewery_type: BreweryType,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryTotal {
    pub country: String,
    pub total: u64,
}

/// Per-country totals plus the bucket of rows without a country
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryTotals {
    pub countries: Vec<CountryTotal>,
    pub unknown_country: u64,
}

impl CountryTotals {
    pub fn total_for(&self, country: &str) -> Option<u64> {
        self.countries
            .iter()
            .find(|c| c.country == country)
            .map(|c| c.total)
    }

    pub fn known_total(&self) -> u64 {
        self.countries.iter().map(|c| c.total).sum()
    }
}

/// One row per curated partition with a column per brewery type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSummary {
    pub location: String,
    pub country: String,
    pub state: String,
    pub by_type: BTreeMap<String, u64>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDataset {
    pub source_run: RunId,
    /// Sorted by (country, state, brewery_type); unknown countries excluded
    pub records: Vec<AggregateRecord>,
    pub totals: CountryTotals,
    pub locations: Vec<LocationSummary>,
}

impl AggregateDataset {
    pub fn record_count_sum(&self) -> u64 {
        self.records.iter().map(|r| r.count).sum()
    }
}
