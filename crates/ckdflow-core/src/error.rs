use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing configuration. Raised before any stage runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cyclic or unresolvable stage dependencies.
    #[error("invalid stage graph: {0}")]
    Graph(String),

    /// Same fingerprint, different payload. The caching contract is broken.
    #[error("integrity violation for artifact {fingerprint}: {detail}")]
    Integrity { fingerprint: String, detail: String },

    /// Input row missing a feature or carrying the wrong type.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("no active model version for '{0}'")]
    NoActiveModel(String),

    /// Empty or degenerate distribution; the statistic is undefined.
    #[error("drift computation failed: {0}")]
    DriftComputation(String),

    #[error("not found: {0}")]
    NotFound(String),

    // The core crate does little I/O, but storage layers map their failures
    // into this variant.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serde(String),

    /// Stage-local failure surfaced by a stage body (training, IO, ...).
    #[error("stage error: {0}")]
    Stage(String),

    #[error("internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    /// Structural failures abort a whole pipeline run: the fingerprint and
    /// caching contract can no longer be trusted once one of these is seen.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Graph(_) | Error::Integrity { .. }
        )
    }

    pub fn integrity(fingerprint: impl ToString, detail: impl Into<String>) -> Self {
        Error::Integrity {
            fingerprint: fingerprint.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
