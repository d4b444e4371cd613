//! Brewlake Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Brewlake workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: content digests recorded in layer manifests
//! - **Run identifiers**: the logical timestamp that tags every pipeline run
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use brewlake_common::{checksum::sha256_hex, RunId};
//!
//! let run_id = RunId::now();
//! let digest = sha256_hex(b"[]");
//! println!("{run_id} {digest}");
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod run_id;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use run_id::RunId;
