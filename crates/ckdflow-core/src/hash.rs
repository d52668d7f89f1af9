//! Stable hashing helpers: stage fingerprints and content hashes.
//!
//! A stage fingerprint covers the stage name, the resolved values of the
//! config keys it declares, the fingerprints of its dependencies (ordered by
//! dependency name), and the content hashes of any raw files it reads. Every
//! field is tagged and length-prefixed so adjacent fields cannot alias.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const DOMAIN: &[u8] = b"ckdflow.stage.v1";
const DERIVE_DOMAIN: &[u8] = b"ckdflow.derive.v1";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        // blake3 hex(32b) is 64 hex chars
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    /// First 12 hex chars; enough for log lines and CLI tables.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }

    /// Fingerprint of a named secondary output of the artifact identified by `self`.
    pub fn derive(&self, label: &str) -> Fingerprint {
        let mut h = Hasher::new();
        h.update(DERIVE_DOMAIN);
        h.update(&self.0);
        update_field(&mut h, b'l', label.as_bytes());
        Fingerprint(h.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::Serde(format!(
                "fingerprint must be 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|e| Error::Serde(e.to_string()))?;
            out[i] = u8::from_str_radix(pair, 16)
                .map_err(|e| Error::Serde(format!("bad fingerprint hex '{pair}': {e}")))?;
        }
        Ok(Fingerprint(out))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Fingerprint {
    let mut h = Hasher::new();
    h.update(bytes);
    Fingerprint(h.finalize().into())
}

pub fn hash_str(s: &str) -> Fingerprint {
    hash_bytes(s.as_bytes())
}

/// Hash any serde-serializable value deterministically (via JSON).
pub fn hash_serde<T: Serialize>(v: &T) -> Result<Fingerprint> {
    let bytes = serde_json::to_vec(v)?;
    Ok(hash_bytes(&bytes))
}

/// Content hash of a file, streamed so large raw datasets are not buffered.
pub fn hash_file(path: &Path) -> Result<Fingerprint> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
    let mut h = Hasher::new();
    std::io::copy(&mut file, &mut h)
        .map_err(|e| Error::Storage(format!("read {}: {e}", path.display())))?;
    Ok(Fingerprint(h.finalize().into()))
}

fn update_field(h: &mut Hasher, tag: u8, bytes: &[u8]) {
    h.update(&[tag]);
    h.update(&(bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

/// Incremental builder for stage fingerprints.
///
/// Callers must feed dependencies and file inputs in a stable order; the
/// orchestrator does this by iterating `BTreeMap`s.
pub struct FingerprintBuilder {
    hasher: Hasher,
}

impl FingerprintBuilder {
    pub fn new(stage: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(DOMAIN);
        update_field(&mut hasher, b's', stage.as_bytes());
        Self { hasher }
    }

    /// Resolved config values. `BTreeMap` keeps key order canonical.
    pub fn config(mut self, values: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let bytes = serde_json::to_vec(values)?;
        update_field(&mut self.hasher, b'c', &bytes);
        Ok(self)
    }

    pub fn dependency(mut self, name: &str, fingerprint: &Fingerprint) -> Self {
        update_field(&mut self.hasher, b'd', name.as_bytes());
        update_field(&mut self.hasher, b'D', &fingerprint.0);
        self
    }

    pub fn file_input(mut self, key: &str, content: &Fingerprint) -> Self {
        update_field(&mut self.hasher, b'f', key.as_bytes());
        update_field(&mut self.hasher, b'F', &content.0);
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}
