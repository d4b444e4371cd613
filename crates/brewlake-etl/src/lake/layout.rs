//! Object key layout of the lake

use brewlake_common::RunId;
use std::fmt;
use uuid::Uuid;

use crate::config::LakeConfig;
use crate::models::PartitionKey;

pub const CURRENT_MANIFEST: &str = "_CURRENT.json";
pub const GENERATION_MANIFEST: &str = "_MANIFEST.json";
pub const RAW_BATCH_FILE: &str = "breweries.json";
pub const PARTITION_FILE: &str = "part-00000.parquet";

const RAW_RUN_SEGMENT: &str = "date_request=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Raw,
    Curated,
    Analytical,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Raw => "raw",
            Layer::Curated => "curated",
            Layer::Analytical => "analytical",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves configured prefixes into concrete keys
#[derive(Debug, Clone)]
pub struct LakeLayout {
    raw: String,
    curated: String,
    analytical: String,
    runs: String,
    lock: String,
}

fn clean(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

impl LakeLayout {
    pub fn new(config: &LakeConfig) -> Self {
        Self {
            raw: clean(&config.raw_prefix),
            curated: clean(&config.curated_prefix),
            analytical: clean(&config.analytical_prefix),
            runs: clean(&config.runs_prefix),
            lock: clean(&config.lock_key),
        }
    }

    pub fn prefix(&self, layer: Layer) -> &str {
        match layer {
            Layer::Raw => &self.raw,
            Layer::Curated => &self.curated,
            Layer::Analytical => &self.analytical,
        }
    }

    /// `<raw>/date_request=<run_id>/breweries.json`
    pub fn raw_batch_key(&self, run_id: &RunId) -> String {
        format!("{}/{}{}/{}", self.raw, RAW_RUN_SEGMENT, run_id, RAW_BATCH_FILE)
    }

    /// Listing prefix covering every raw batch
    pub fn raw_batches_prefix(&self) -> String {
        format!("{}/{}", self.raw, RAW_RUN_SEGMENT)
    }

    pub fn current_manifest_key(&self, layer: Layer) -> String {
        format!("{}/{}", self.prefix(layer), CURRENT_MANIFEST)
    }

    pub fn generations_prefix(&self, layer: Layer) -> String {
        format!("{}/generations/", self.prefix(layer))
    }

    pub fn generation_prefix(&self, layer: Layer, generation: &str) -> String {
        format!("{}{}/", self.generations_prefix(layer), generation)
    }

    pub fn object_key(&self, layer: Layer, generation: &str, relative: &str) -> String {
        format!("{}{}", self.generation_prefix(layer, generation), relative)
    }

    pub fn run_report_key(&self, run_id: &RunId) -> String {
        format!("{}/{}.json", self.runs, run_id)
    }

    pub fn lock_key(&self) -> &str {
        &self.lock
    }
}

/// Fresh generation name, `<run_id>_<8 hex>`
pub fn new_generation(run_id: &RunId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", run_id, &suffix[..8])
}

/// Generation name of a key under `generations_prefix`, if any
pub fn generation_of<'a>(generations_prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(generations_prefix)?
        .split('/')
        .next()
        .filter(|g| !g.is_empty())
}

/// Percent-encode one partition value for use as a key segment
pub fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub fn decode_segment(segment: &str) -> String {
    url::form_urlencoded::parse(segment.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

/// `country=<c>/state=<s>/part-00000.parquet`
pub fn partition_path(partition: &PartitionKey) -> String {
    format!(
        "country={}/state={}/{}",
        encode_segment(&partition.country),
        encode_segment(&partition.state),
        PARTITION_FILE
    )
}

/// Inverse of [`partition_path`]; accepts a full object key
pub fn parse_partition_path(key: &str) -> Option<PartitionKey> {
    let mut country = None;
    let mut state = None;
    for segment in key.split('/') {
        if let Some(v) = segment.strip_prefix("country=") {
            country = Some(decode_segment(v));
        } else if let Some(v) = segment.strip_prefix("state=") {
            state = Some(decode_segment(v));
        }
    }
    Some(PartitionKey::new(country?, state?))
}

/// Run id encoded in a raw batch key
pub fn raw_run_id(key: &str) -> Option<RunId> {
    key.split('/')
        .find_map(|segment| segment.strip_prefix(RAW_RUN_SEGMENT))
        .and_then(|id| id.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn layout() -> LakeLayout {
        LakeLayout::new(&LakeConfig {
            raw_prefix: "/bronze/".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_raw_batch_key() {
        let run: RunId = "20240315_120000".parse().unwrap();
        let key = layout().raw_batch_key(&run);
        assert_eq!(key, "bronze/date_request=20240315_120000/breweries.json");
        assert_eq!(raw_run_id(&key), Some(run));
        assert_eq!(raw_run_id("bronze/elsewhere/breweries.json"), None);
    }

    #[test]
    fn test_generation_keys() {
        let layout = layout();
        let run: RunId = "20240315_120000".parse().unwrap();
        let generation = new_generation(&run);
        assert!(generation.starts_with("20240315_120000_"));
        assert_eq!(generation.len(), "20240315_120000_".len() + 8);

        let key = layout.object_key(Layer::Curated, &generation, "a/b.parquet");
        let prefix = layout.generations_prefix(Layer::Curated);
        assert_eq!(generation_of(&prefix, &key), Some(generation.as_str()));
        assert_eq!(generation_of(&prefix, "curated/_CURRENT.json"), None);
        assert_eq!(
            layout.current_manifest_key(Layer::Analytical),
            "analytical/_CURRENT.json"
        );
    }

    #[test]
    fn test_partition_path_encodes_values() {
        let partition = PartitionKey::new("United States", "Rhode Island/Providence");
        let path = partition_path(&partition);
        assert_eq!(
            path,
            "country=United+States/state=Rhode+Island%2FProvidence/part-00000.parquet"
        );
        assert_eq!(parse_partition_path(&path), Some(partition));
    }

    #[test]
    fn test_partition_path_non_ascii() {
        let partition = PartitionKey::new("Österreich", "Kärnten");
        let path = partition_path(&partition);
        assert!(path.is_ascii());
        assert_eq!(parse_partition_path(&format!("curated/generations/g/{path}")), Some(partition));
    }
}
