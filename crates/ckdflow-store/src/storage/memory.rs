//! In-memory storage backend for testing.
//!
//! Provides a map-based storage that implements the `Storage` trait.
//! Used for `memory://` roots in tests to avoid file I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ckdflow_core::error::{Error, Result};

use super::Storage;

/// Thread-safe in-memory storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.data
            .lock()
            .map_err(|_| Error::Invariant("memory storage lock poisoned".into()))
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.lock()?
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn size(&self, key: &str) -> Result<u64> {
        self.lock()?
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn location(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
