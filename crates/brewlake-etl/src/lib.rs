//! Brewlake ETL engine
//!
//! Moves Open Brewery DB data through a three-layer lake:
//!
//! - **Raw**: every extraction run lands as one immutable batch, verbatim
//! - **Curated**: typed, deduplicated records partitioned by country and state
//! - **Analytical**: brewery counts by location and type
//!
//! [`RunCoordinator`] drives the stages in order under a cross-process run
//! lock. Curated and analytical layers are published atomically through a
//! manifest pointer, so readers never observe a partial generation.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aggregate;
pub mod cli;
pub mod columnar;
pub mod config;
pub mod coordinator;
pub mod curate;
pub mod error;
pub mod extract;
pub mod lake;
pub mod models;
pub mod storage;

// Re-export commonly used types
pub use cli::{Cli, Commands};
pub use config::PipelineConfig;
pub use coordinator::{RunCoordinator, RunError, RunReport, RunState, Stage};
pub use error::{EtlError, Result};
pub use storage::ObjectStore;
