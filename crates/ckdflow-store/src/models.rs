//! Versioned model registry.
//!
//! Each model name owns an ordered list of versions (1, 2, 3, ...). At most one
//! version per name is active. Every mutation is a read-modify-write under one
//! mutex: the new state is computed, persisted to `models.json`, and only then
//! swapped in, so no observer ever sees two active versions or a state that
//! was not persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::Fingerprint;
use ckdflow_core::record::ModelVersion;
use ckdflow_core::time::now_millis;

use crate::storage::Storage;

const MODELS_KEY: &str = "models.json";

type Versions = BTreeMap<String, Vec<ModelVersion>>;

pub struct ModelRegistry {
    storage: Arc<dyn Storage>,
    models: Mutex<Versions>,
}

impl ModelRegistry {
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let models: Versions = if storage.exists(MODELS_KEY)? {
            serde_json::from_slice(&storage.read(MODELS_KEY)?)
                .map_err(|e| Error::Storage(format!("corrupt {MODELS_KEY}: {e}")))?
        } else {
            Versions::new()
        };
        Ok(Self {
            storage,
            models: Mutex::new(models),
        })
    }

    pub fn empty(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            models: Mutex::new(Versions::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Versions>> {
        self.models
            .lock()
            .map_err(|_| Error::Invariant("model registry lock poisoned".into()))
    }

    fn persist(&self, state: &Versions) -> Result<()> {
        self.storage
            .write(MODELS_KEY, &serde_json::to_vec_pretty(state)?)
    }

    /// Register a new version (max existing + 1, starting at 1), inactive.
    pub fn register(
        &self,
        model_name: &str,
        artifact_fingerprint: Fingerprint,
        metrics: BTreeMap<String, f64>,
    ) -> Result<ModelVersion> {
        let mut models = self.lock()?;
        let versions = models.get(model_name).map(Vec::as_slice).unwrap_or(&[]);
        let next = versions
            .iter()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = ModelVersion {
            model_name: model_name.to_string(),
            version_number: next,
            artifact_fingerprint,
            metrics,
            is_active: false,
            registered_ms: now_millis(),
            promoted_ms: None,
        };

        let mut staged = models.clone();
        staged
            .entry(model_name.to_string())
            .or_default()
            .push(version.clone());
        self.persist(&staged)?;
        *models = staged;

        tracing::info!(
            model = model_name,
            version = next,
            artifact = %artifact_fingerprint.short(),
            "model version registered"
        );
        Ok(version)
    }

    /// Make `version_number` the single active version of `model_name`,
    /// demoting the previous one in the same committed state.
    pub fn promote(&self, model_name: &str, version_number: u32) -> Result<ModelVersion> {
        let mut models = self.lock()?;
        let versions = models
            .get(model_name)
            .ok_or_else(|| Error::NotFound(format!("model '{model_name}'")))?;
        if !versions.iter().any(|v| v.version_number == version_number) {
            return Err(Error::NotFound(format!(
                "model '{model_name}' version {version_number}"
            )));
        }

        let now = now_millis();
        let previous = versions
            .iter()
            .find(|v| v.is_active)
            .map(|v| v.version_number);
        let updated: Vec<ModelVersion> = versions
            .iter()
            .cloned()
            .map(|mut v| {
                let activate = v.version_number == version_number;
                if activate && !v.is_active {
                    v.promoted_ms = Some(now);
                }
                v.is_active = activate;
                v
            })
            .collect();

        let mut staged = models.clone();
        staged.insert(model_name.to_string(), updated);
        self.persist(&staged)?;
        *models = staged;

        tracing::info!(
            model = model_name,
            version = version_number,
            previous = ?previous,
            "model version promoted"
        );
        self.find(&models, model_name, version_number)
    }

    fn find(&self, models: &Versions, model_name: &str, version_number: u32) -> Result<ModelVersion> {
        models
            .get(model_name)
            .and_then(|vs| vs.iter().find(|v| v.version_number == version_number))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("model '{model_name}' version {version_number}"))
            })
    }

    /// The serving read path.
    pub fn get_active(&self, model_name: &str) -> Result<ModelVersion> {
        self.lock()?
            .get(model_name)
            .and_then(|vs| vs.iter().find(|v| v.is_active))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("active version of model '{model_name}'")))
    }

    pub fn get(&self, model_name: &str, version_number: u32) -> Result<ModelVersion> {
        let models = self.lock()?;
        self.find(&models, model_name, version_number)
    }

    /// All versions of a model in version order.
    pub fn versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        Ok(self.lock()?.get(model_name).cloned().unwrap_or_default())
    }

    /// Latest version registered for a given artifact, if any.
    pub fn find_by_artifact(
        &self,
        model_name: &str,
        artifact_fingerprint: &Fingerprint,
    ) -> Result<Option<ModelVersion>> {
        Ok(self.lock()?.get(model_name).and_then(|vs| {
            vs.iter()
                .rev()
                .find(|v| &v.artifact_fingerprint == artifact_fingerprint)
                .cloned()
        }))
    }
}
