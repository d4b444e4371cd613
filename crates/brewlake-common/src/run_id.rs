//! Logical run timestamps
//!
//! Every pipeline run is identified by the UTC time it started, rendered as
//! `YYYYMMDD_hhmmss`. The textual form sorts chronologically, which the lake
//! relies on when ordering raw batches and layer generations.

use crate::error::{CommonError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Identifier of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Run id for the current instant
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(RUN_ID_FORMAT).to_string())
    }

    /// The instant this run id encodes
    pub fn started_at(&self) -> Result<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, RUN_ID_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|_| CommonError::InvalidRunId {
                value: self.0.clone(),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        NaiveDateTime::parse_from_str(trimmed, RUN_ID_FORMAT).map_err(|_| {
            CommonError::InvalidRunId {
                value: s.to_string(),
            }
        })?;
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for RunId {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
