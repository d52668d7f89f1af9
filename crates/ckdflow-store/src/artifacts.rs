//! Content-addressed artifact store.
//!
//! Artifacts are keyed by the fingerprint of the inputs that produced them and
//! are immutable once written. Layout under the storage root:
//!
//! ```text
//! artifacts/<fingerprint-hex>.bin   payload
//! artifacts/<fingerprint-hex>.json  metadata (written last; its presence commits the artifact)
//! ```
//!
//! The metadata index is held in memory so `exists` never touches payloads.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::{hash_bytes, Fingerprint};
use ckdflow_core::record::{Artifact, ArtifactKind};
use ckdflow_core::time::now_millis;

use crate::storage::Storage;

const PREFIX: &str = "artifacts/";

fn payload_key(fp: &Fingerprint) -> String {
    format!("{PREFIX}{}.bin", fp.to_hex())
}

fn meta_key(fp: &Fingerprint) -> String {
    format!("{PREFIX}{}.json", fp.to_hex())
}

pub struct ArtifactStore {
    storage: Arc<dyn Storage>,
    index: RwLock<BTreeMap<Fingerprint, Artifact>>,
    // Serializes writers so concurrent puts of one fingerprint converge.
    write_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Open a store, rebuilding the index from committed metadata files.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let mut index = BTreeMap::new();
        for key in storage.list(PREFIX)? {
            if !key.ends_with(".json") {
                continue;
            }
            let bytes = storage.read(&key)?;
            let artifact: Artifact = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Storage(format!("corrupt artifact metadata {key}: {e}")))?;
            index.insert(artifact.fingerprint, artifact);
        }
        tracing::debug!(artifacts = index.len(), "opened artifact store");
        Ok(Self {
            storage,
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        })
    }

    /// A store that ignores anything already present in `storage`.
    pub fn empty(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            index: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let index = self
            .index
            .read()
            .map_err(|_| Error::Invariant("artifact index lock poisoned".into()))?;
        Ok(index.get(fingerprint).cloned())
    }

    /// Store a payload under `fingerprint`.
    ///
    /// Idempotent for equal payloads: the existing artifact is returned and
    /// nothing is written. A different payload (or kind) under an existing
    /// fingerprint is an `Error::Integrity`.
    pub fn put(
        &self,
        fingerprint: Fingerprint,
        kind: ArtifactKind,
        producing_stage: &str,
        payload: &[u8],
    ) -> Result<Artifact> {
        let content_hash = hash_bytes(payload);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Invariant("artifact write lock poisoned".into()))?;

        if let Some(existing) = self.lookup(&fingerprint)? {
            if existing.content_hash != content_hash {
                return Err(Error::integrity(
                    fingerprint,
                    format!(
                        "stored content {} differs from new content {}",
                        existing.content_hash.short(),
                        content_hash.short()
                    ),
                ));
            }
            if existing.kind != kind {
                return Err(Error::integrity(
                    fingerprint,
                    format!("stored kind {} differs from new kind {}", existing.kind, kind),
                ));
            }
            tracing::debug!(fingerprint = %fingerprint.short(), "artifact already stored");
            return Ok(existing);
        }

        let key = payload_key(&fingerprint);
        self.storage.write(&key, payload)?;
        let artifact = Artifact {
            fingerprint,
            kind,
            location: self.storage.location(&key),
            created_ms: now_millis(),
            producing_stage: producing_stage.to_string(),
            content_hash,
            size_bytes: payload.len() as u64,
        };
        self.storage
            .write(&meta_key(&fingerprint), &serde_json::to_vec_pretty(&artifact)?)?;

        self.index
            .write()
            .map_err(|_| Error::Invariant("artifact index lock poisoned".into()))?
            .insert(fingerprint, artifact.clone());
        tracing::debug!(
            fingerprint = %fingerprint.short(),
            kind = %kind,
            stage = producing_stage,
            bytes = artifact.size_bytes,
            "artifact stored"
        );
        Ok(artifact)
    }

    /// Serialize `value` as JSON and store it.
    pub fn put_json<T: Serialize>(
        &self,
        fingerprint: Fingerprint,
        kind: ArtifactKind,
        producing_stage: &str,
        value: &T,
    ) -> Result<Artifact> {
        let bytes = serde_json::to_vec(value)?;
        self.put(fingerprint, kind, producing_stage, &bytes)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Artifact> {
        self.lookup(fingerprint)?
            .ok_or_else(|| Error::NotFound(format!("artifact {fingerprint}")))
    }

    /// Cache-hit primitive: metadata lookup only.
    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.index
            .read()
            .map(|index| index.contains_key(fingerprint))
            .unwrap_or(false)
    }

    /// Read and verify the payload.
    pub fn read(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let artifact = self.get(fingerprint)?;
        let bytes = self.storage.read(&payload_key(fingerprint))?;
        if hash_bytes(&bytes) != artifact.content_hash {
            return Err(Error::integrity(
                fingerprint,
                "payload on storage does not match recorded content hash",
            ));
        }
        Ok(bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Result<T> {
        let bytes = self.read(fingerprint)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All artifacts of a kind, ordered by creation time.
    pub fn list(&self, kind: Option<ArtifactKind>) -> Vec<Artifact> {
        let mut out: Vec<Artifact> = self
            .index
            .read()
            .map(|i| {
                i.values()
                    .filter(|a| kind.map(|k| a.kind == k).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|a| a.created_ms);
        out
    }
}
