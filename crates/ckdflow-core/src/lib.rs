#![forbid(unsafe_code)]
//! ckdflow-core: shared vocabulary for the pipeline engine.
//!
//! Everything here is plain data plus deterministic helpers:
//! - `hash`: blake3 fingerprints for stages and content
//! - `record`: artifacts, run records, model versions
//! - `types` / `schema`: tabular rows and the feature schema that validates them
//! - `config`: the YAML/env configuration document
//! - `error`: the error taxonomy every crate maps into
//!
//! No async runtime and no storage backends live here.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod record;
pub mod schema;
pub mod time;
pub mod types;

/// Engine version string recorded on run records for provenance.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
