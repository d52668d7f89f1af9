#![forbid(unsafe_code)]
//! ckdflow-store: shared, concurrently accessed state of the pipeline.
//!
//! - `storage`: byte-level backends (`FsStorage`, `MemoryStorage`)
//! - `artifacts`: content-addressed, immutable artifact store
//! - `runs`: append-only run log with filtered, restartable queries
//! - `models`: versioned model registry with atomic promotion
//!
//! All three stores take an `Arc<dyn Storage>` so a process can point them at
//! one root directory, or at one in-memory map in tests.

pub mod artifacts;
pub mod models;
pub mod runs;
pub mod storage;

pub use artifacts::ArtifactStore;
pub use models::ModelRegistry;
pub use runs::{RunFilter, RunQuery, RunRegistry};
pub use storage::{open_storage, FsStorage, MemoryStorage, Storage};

use std::sync::Arc;

use ckdflow_core::error::Result;

/// The three stores opened over one storage root.
#[derive(Clone)]
pub struct Stores {
    pub artifacts: Arc<ArtifactStore>,
    pub runs: Arc<RunRegistry>,
    pub models: Arc<ModelRegistry>,
}

impl Stores {
    /// Open (or create) all stores under `root` (see [`open_storage`]).
    pub fn open(root: &str) -> Result<Self> {
        let storage = open_storage(root)?;
        Self::with_storage(storage)
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Result<Self> {
        Ok(Self {
            artifacts: Arc::new(ArtifactStore::open(Arc::clone(&storage))?),
            runs: Arc::new(RunRegistry::open(Arc::clone(&storage))?),
            models: Arc::new(ModelRegistry::open(storage)?),
        })
    }

    /// In-memory stores for tests and dry runs.
    pub fn in_memory() -> Self {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        Self {
            artifacts: Arc::new(ArtifactStore::empty(Arc::clone(&storage))),
            runs: Arc::new(RunRegistry::empty(Arc::clone(&storage))),
            models: Arc::new(ModelRegistry::empty(storage)),
        }
    }
}
