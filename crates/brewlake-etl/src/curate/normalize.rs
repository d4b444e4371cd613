//! Field-level normalisation of raw brewery records

use brewlake_common::RunId;
use serde_json::{Map, Value};

use crate::models::{BreweryType, CuratedRecord, UNKNOWN};

pub const LATITUDE_BOUND: f64 = 90.0;
pub const LONGITUDE_BOUND: f64 = 180.0;

/// A curated record plus the recoverable defects found while building it
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: CuratedRecord,
    pub latitude_nulled: bool,
    pub longitude_nulled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinate {
    Missing,
    Valid(f64),
    /// Present but unusable; stored as null
    Rejected,
}

impl Coordinate {
    pub fn value(self) -> Option<f64> {
        match self {
            Coordinate::Valid(v) => Some(v),
            _ => None,
        }
    }
}

/// Parse one raw record. `None` means it has no usable identifier.
pub fn normalize(raw: &str, date_request: &RunId) -> Option<Normalized> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object()?;
    let id = identifier(obj.get("id"))?;

    let latitude = coordinate(obj.get("latitude"), LATITUDE_BOUND);
    let longitude = coordinate(obj.get("longitude"), LONGITUDE_BOUND);

    let record = CuratedRecord {
        id,
        name: text(obj, &["name"]),
        brewery_type: obj
            .get("brewery_type")
            .and_then(Value::as_str)
            .map(BreweryType::from_raw)
            .unwrap_or(BreweryType::Unknown),
        street: text(obj, &["street", "address_1"]),
        address_2: text(obj, &["address_2"]),
        address_3: text(obj, &["address_3"]),
        city: geography(obj, &["city"]),
        state: geography(obj, &["state", "state_province"]),
        postal_code: text(obj, &["postal_code"]),
        country: geography(obj, &["country"]),
        latitude: latitude.value(),
        longitude: longitude.value(),
        phone: text(obj, &["phone"]),
        website_url: text(obj, &["website_url"]),
        date_request: date_request.clone(),
    };

    Some(Normalized {
        record,
        latitude_nulled: latitude == Coordinate::Rejected,
        longitude_nulled: longitude == Coordinate::Rejected,
    })
}

/// Non-empty trimmed string id, or an integer rendered as a string
pub fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty string among `keys`, trimmed; numbers are rendered
pub fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Like [`text`] but strings only, with [`UNKNOWN`] as the fallback
pub fn geography(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| {
            let trimmed = obj.get(*key)?.as_str()?.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Accepts numbers and numeric strings within `[-bound, bound]`
pub fn coordinate(value: Option<&Value>, bound: f64) -> Coordinate {
    let parsed = match value {
        None | Some(Value::Null) => return Coordinate::Missing,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Coordinate::Missing,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match parsed {
        Some(v) if v.is_finite() && (-bound..=bound).contains(&v) => Coordinate::Valid(v),
        _ => Coordinate::Rejected,
    }
}
