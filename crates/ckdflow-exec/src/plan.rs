//! Fingerprint resolution.
//!
//! Fingerprints are computed for every stage, in topological order, before
//! anything runs: a stage's fingerprint covers its name, its resolved config,
//! its dependencies' fingerprints and the content of its file inputs. Caching
//! is therefore transitive: changing anything upstream changes every
//! fingerprint downstream of it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::Value as JsonValue;

use ckdflow_core::error::{Error, Result};
use ckdflow_core::hash::{hash_file, Fingerprint, FingerprintBuilder};

use crate::graph::StageGraph;

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Dependency name -> dependency fingerprint.
    pub inputs: BTreeMap<String, Fingerprint>,
    pub config: BTreeMap<String, JsonValue>,
    /// File-input config key -> content hash.
    pub file_hashes: BTreeMap<String, Fingerprint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    stages: Vec<PlannedStage>,
}

impl Plan {
    pub fn resolve(graph: &StageGraph) -> Result<Self> {
        let mut fingerprints: BTreeMap<&str, Fingerprint> = BTreeMap::new();
        let mut stages = Vec::with_capacity(graph.len());

        for name in graph.order() {
            let node = graph
                .node(name)
                .ok_or_else(|| Error::Invariant(format!("stage '{name}' missing from graph")))?;

            let mut inputs = BTreeMap::new();
            for dep in &node.spec.dependencies {
                let fp = fingerprints.get(dep.as_str()).copied().ok_or_else(|| {
                    Error::Invariant(format!("dependency '{dep}' of '{name}' not yet planned"))
                })?;
                inputs.insert(dep.clone(), fp);
            }

            let mut file_hashes = BTreeMap::new();
            for key in &node.spec.file_inputs {
                let path = node.config.get(key).and_then(JsonValue::as_str).ok_or_else(|| {
                    Error::Config(format!("stage '{name}': file input '{key}' is not a path"))
                })?;
                let hash = hash_file(Path::new(path)).map_err(|e| {
                    Error::Config(format!("stage '{name}': file input '{key}': {e}"))
                })?;
                file_hashes.insert(key.clone(), hash);
            }

            let mut builder = FingerprintBuilder::new(name).config(&node.config)?;
            for (dep, fp) in &inputs {
                builder = builder.dependency(dep, fp);
            }
            for (key, hash) in &file_hashes {
                builder = builder.file_input(key, hash);
            }
            let fingerprint = builder.finish();
            tracing::debug!(stage = %name, fingerprint = %fingerprint.short(), "planned");

            fingerprints.insert(name.as_str(), fingerprint);
            stages.push(PlannedStage {
                name: name.clone(),
                fingerprint,
                inputs,
                config: node.config.clone(),
                file_hashes,
            });
        }
        Ok(Self { stages })
    }

    /// Stages in topological order.
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn fingerprint(&self, name: &str) -> Option<Fingerprint> {
        self.get(name).map(|s| s.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{StageContext, StageError, StageResult};
    use crate::graph::StageSpec;
    use serde_json::json;

    fn noop(name: &str) -> StageSpec {
        StageSpec::new(name, |_: &StageContext| -> StageResult {
            Err(StageError::error("unused"))
        })
    }

    fn graph(lr: f64) -> StageGraph {
        let mut train = BTreeMap::new();
        train.insert("learning_rate".to_string(), json!(lr));
        StageGraph::builder()
            .add(noop("preprocess").optional("seed", json!(42)), BTreeMap::new())
            .add(noop("train").depends_on("preprocess").required("learning_rate"), train)
            .add(noop("evaluate").depends_on("train"), BTreeMap::new())
            .add(noop("baseline").depends_on("preprocess"), BTreeMap::new())
            .build()
            .unwrap()
    }

    #[test]
    fn planning_is_deterministic() {
        let a = Plan::resolve(&graph(0.1)).unwrap();
        let b = Plan::resolve(&graph(0.1)).unwrap();
        for s in a.stages() {
            assert_eq!(Some(s.fingerprint), b.fingerprint(&s.name));
        }
    }

    #[test]
    fn config_change_invalidates_downstream_only() {
        let a = Plan::resolve(&graph(0.1)).unwrap();
        let b = Plan::resolve(&graph(0.2)).unwrap();
        assert_eq!(a.fingerprint("preprocess"), b.fingerprint("preprocess"));
        assert_eq!(a.fingerprint("baseline"), b.fingerprint("baseline"));
        assert_ne!(a.fingerprint("train"), b.fingerprint("train"));
        assert_ne!(a.fingerprint("evaluate"), b.fingerprint("evaluate"));
    }

    #[test]
    fn file_content_enters_fingerprint() {
        let dir = std::env::temp_dir().join(format!("ckdflow-plan-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("raw.csv");

        let build = || {
            let mut params = BTreeMap::new();
            params.insert("raw_path".to_string(), json!(path.to_string_lossy()));
            StageGraph::builder()
                .add(noop("preprocess").file_input("raw_path"), params)
                .build()
                .unwrap()
        };

        std::fs::write(&path, "gfr\n90\n").unwrap();
        let first = Plan::resolve(&build()).unwrap().fingerprint("preprocess");
        std::fs::write(&path, "gfr\n91\n").unwrap();
        let second = Plan::resolve(&build()).unwrap().fingerprint("preprocess");
        assert_ne!(first, second);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(Plan::resolve(&build()), Err(Error::Config(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
