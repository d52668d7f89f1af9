//! Byte-level storage backends.
//!
//! - `fs`: local filesystem rooted at a directory (default).
//! - `memory`: process-local map, for tests and `memory://` roots.
//!
//! Keys are `/`-separated paths relative to the backend root.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use ckdflow_core::error::{Error, Result};

/// Abstract storage interface shared by the artifact store and registries.
pub trait Storage: Send + Sync {
    /// Write bytes to a key, replacing any previous content. Writers must make
    /// the new content visible atomically (no torn reads).
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Append bytes to a key, creating it if needed.
    fn append(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read the whole content of a key. Missing keys are `Error::NotFound`.
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Cheap presence check; never reads content.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key. Idempotent (no error if the key doesn't exist).
    fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under a prefix, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a key in bytes.
    fn size(&self, key: &str) -> Result<u64>;

    /// Human-readable location of a key (path or URI), recorded on artifacts.
    fn location(&self, key: &str) -> String;
}

/// Choose a backend from a root string.
///
/// - `memory://<name>` → fresh `MemoryStorage`
/// - `file:///abs/path` or a bare path → `FsStorage`
pub fn open_storage(root: &str) -> Result<Arc<dyn Storage>> {
    match root.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryStorage::new())),
        Some(("file", rest)) => {
            let path = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
            Ok(Arc::new(FsStorage::new(path)?))
        }
        Some((other, _)) => Err(Error::Config(format!(
            "unsupported storage scheme '{other}'"
        ))),
        None => Ok(Arc::new(FsStorage::new(root)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_config_error() {
        let err = open_storage("s3://bucket/prefix").err().expect("should fail");
        assert!(err.to_string().contains("unsupported storage scheme"));
    }

    #[test]
    fn memory_scheme_opens_empty_store() {
        let s = open_storage("memory://tests").unwrap();
        assert!(s.list("").unwrap().is_empty());
    }
}
