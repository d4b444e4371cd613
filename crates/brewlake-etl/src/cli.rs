//! Command-line interface definition

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{PipelineConfig, StorageBackend};
use crate::error::Result;
use crate::storage::StorageConfig;

/// Brewlake - Open Brewery DB medallion pipeline
#[derive(Parser, Debug)]
#[command(name = "brewlake")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Storage backend, overrides BREWLAKE_STORAGE
    #[arg(long, value_enum, global = true)]
    pub storage: Option<BackendKind>,

    /// Lake root directory for the local backend
    #[arg(long, global = true)]
    pub local_root: Option<PathBuf>,

    #[arg(long, global = true)]
    pub raw_prefix: Option<String>,

    #[arg(long, global = true)]
    pub curated_prefix: Option<String>,

    #[arg(long, global = true)]
    pub analytical_prefix: Option<String>,

    #[arg(long, global = true)]
    pub runs_prefix: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: extract, curate, aggregate
    Run,

    /// Extract one raw batch from the upstream API
    Extract,

    /// Curate an existing raw batch into the curated layer
    Curate {
        /// Raw batch key, e.g. raw/date_request=20240315_120000/breweries.json
        #[arg(long)]
        raw_key: String,
    },

    /// Rebuild the analytical layer from the current curated layer
    Aggregate,

    /// Show the published manifests of each layer
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Local,
    S3,
}

impl Cli {
    /// Apply command-line overrides on top of the environment configuration
    pub fn apply_overrides(&self, config: &mut PipelineConfig) -> Result<()> {
        match self.storage {
            Some(BackendKind::S3) => {
                if !matches!(config.storage, StorageBackend::S3(_)) {
                    let s3 = StorageConfig::from_env()
                        .map_err(|e| crate::error::EtlError::Config(e.to_string()))?;
                    config.storage = StorageBackend::S3(s3);
                }
            },
            Some(BackendKind::Local) => {
                if !matches!(config.storage, StorageBackend::Local { .. }) {
                    config.storage = StorageBackend::default();
                }
            },
            None => {},
        }

        if let Some(root) = &self.local_root {
            if let StorageBackend::Local { root: current } = &mut config.storage {
                *current = root.clone();
            }
        }

        let lake = &mut config.lake;
        for (flag, target) in [
            (&self.raw_prefix, &mut lake.raw_prefix),
            (&self.curated_prefix, &mut lake.curated_prefix),
            (&self.analytical_prefix, &mut lake.analytical_prefix),
            (&self.runs_prefix, &mut lake.runs_prefix),
        ] {
            if let Some(value) = flag {
                *target = value.clone();
            }
        }

        config.validate()
    }
}
