//! The serving boundary: one feature row in, one labelled score out.
//!
//! The active model is looked up on every call, so a promotion takes effect
//! on the next prediction. The deserialized artifact is cached by
//! fingerprint.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use ckdflow_core::prelude::{Error, Fingerprint, Result, Row};
use ckdflow_store::{ArtifactStore, ModelRegistry, Stores};

use crate::stages::ModelArtifact;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Probability of the positive class.
    pub score: f64,
    pub model_version: u32,
}

pub struct Predictor {
    models: Arc<ModelRegistry>,
    artifacts: Arc<ArtifactStore>,
    model_name: String,
    loaded: RwLock<Option<(Fingerprint, Arc<ModelArtifact>)>>,
}

impl Predictor {
    pub fn new(stores: &Stores, model_name: impl Into<String>) -> Self {
        Self {
            models: Arc::clone(&stores.models),
            artifacts: Arc::clone(&stores.artifacts),
            model_name: model_name.into(),
            loaded: RwLock::new(None),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn predict(&self, features: &Row) -> Result<Prediction> {
        let active = match self.models.get_active(&self.model_name) {
            Ok(v) => v,
            Err(Error::NotFound(_)) => return Err(Error::NoActiveModel(self.model_name.clone())),
            Err(e) => return Err(e),
        };
        let model = self.load(&active.artifact_fingerprint)?;

        model.encoder.schema().validate_row(features)?;
        let x = model.encoder.encode(features);
        let score = model.params.score(&x);
        Ok(Prediction {
            label: model.label(score).to_string(),
            score,
            model_version: active.version_number,
        })
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Arc<ModelArtifact>> {
        {
            let loaded = self
                .loaded
                .read()
                .map_err(|_| Error::Invariant("predictor cache lock poisoned".into()))?;
            if let Some((fp, model)) = loaded.as_ref() {
                if fp == fingerprint {
                    return Ok(Arc::clone(model));
                }
            }
        }
        let model: Arc<ModelArtifact> = Arc::new(self.artifacts.read_json(fingerprint)?);
        tracing::info!(
            model = %self.model_name,
            artifact = %fingerprint.short(),
            algorithm = %model.algorithm,
            "loaded model for serving"
        );
        let mut loaded = self
            .loaded
            .write()
            .map_err(|_| Error::Invariant("predictor cache lock poisoned".into()))?;
        *loaded = Some((*fingerprint, Arc::clone(&model)));
        Ok(model)
    }
}
