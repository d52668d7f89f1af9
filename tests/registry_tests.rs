//! Registries on the filesystem backend: persistence, concurrency, integrity

mod test_data_gen;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use ckdflow_core::error::Error;
use ckdflow_core::hash::hash_str;
use ckdflow_core::record::{ArtifactKind, FailureReason, RunRecord, RunState};
use ckdflow_store::{RunFilter, Stores};
use test_data_gen::create_temp_dir;

fn open(root: &std::path::Path) -> Stores {
    Stores::open(&root.display().to_string()).expect("Failed to open stores")
}

#[test]
fn registry_state_survives_reopen() {
    let dir = create_temp_dir("registry-reopen");
    {
        let stores = open(&dir);
        for i in 0..3 {
            let fp = hash_str(&format!("model-{i}"));
            stores
                .artifacts
                .put(fp, ArtifactKind::Model, "train", format!("weights {i}").as_bytes())
                .unwrap();
            let v = stores
                .models
                .register("ckd", fp, BTreeMap::from([("f1".to_string(), 0.8)]))
                .unwrap();
            assert_eq!(v.version_number, i + 1);
        }
        stores.models.promote("ckd", 2).unwrap();
        stores
            .runs
            .record(RunRecord::start("train", hash_str("model-0")).succeed(
                vec![hash_str("model-0")],
                BTreeMap::new(),
                BTreeMap::new(),
            ))
            .unwrap();
    }

    let stores = open(&dir);
    assert_eq!(stores.models.get_active("ckd").unwrap().version_number, 2);
    assert_eq!(stores.models.versions("ckd").unwrap().len(), 3);
    assert_eq!(stores.artifacts.len(), 3);
    assert_eq!(
        stores.artifacts.read(&hash_str("model-1")).unwrap(),
        b"weights 1".to_vec()
    );
    assert_eq!(stores.runs.len(), 1);

    // numbering continues after reopen
    let v = stores.models.register("ckd", hash_str("model-9"), BTreeMap::new()).unwrap();
    assert_eq!(v.version_number, 4);
    assert!(!v.is_active);
}

#[test]
fn concurrent_promotions_leave_exactly_one_active_version() {
    let dir = create_temp_dir("registry-promote-race");
    let stores = open(&dir);
    for i in 0..8 {
        stores
            .models
            .register("ckd", hash_str(&format!("m{i}")), BTreeMap::new())
            .unwrap();
    }

    let models = Arc::clone(&stores.models);
    let handles: Vec<_> = (1..=8u32)
        .map(|version| {
            let models = Arc::clone(&models);
            thread::spawn(move || {
                for _ in 0..10 {
                    models.promote("ckd", version).unwrap();
                    let active: Vec<u32> = models
                        .versions("ckd")
                        .unwrap()
                        .iter()
                        .filter(|v| v.is_active)
                        .map(|v| v.version_number)
                        .collect();
                    assert_eq!(active.len(), 1, "{active:?}");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let winner = stores.models.get_active("ckd").unwrap().version_number;
    drop(stores);
    let reopened = open(&dir);
    assert_eq!(reopened.models.get_active("ckd").unwrap().version_number, winner);
}

#[test]
fn concurrent_identical_puts_converge() {
    let dir = create_temp_dir("artifact-put-race");
    let stores = open(&dir);
    let fp = hash_str("shared");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let artifacts = Arc::clone(&stores.artifacts);
            thread::spawn(move || artifacts.put(fp, ArtifactKind::Dataset, "preprocess", b"rows"))
        })
        .collect();
    let created: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().created_ms)
        .collect();
    assert!(created.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(stores.artifacts.len(), 1);

    let err = stores
        .artifacts
        .put(fp, ArtifactKind::Dataset, "preprocess", b"other rows")
        .unwrap_err();
    assert!(matches!(err, Error::Integrity { .. }));
    assert!(err.is_structural());
    assert_eq!(stores.artifacts.read(&fp).unwrap(), b"rows".to_vec());
}

#[test]
fn run_queries_filter_and_restart() {
    let dir = create_temp_dir("run-queries");
    let stores = open(&dir);
    let ok = |stage: &str| {
        RunRecord::start(stage, hash_str(stage)).succeed(Vec::new(), BTreeMap::new(), BTreeMap::new())
    };
    stores.runs.record(ok("preprocess")).unwrap();
    stores.runs.record(ok("train")).unwrap();
    stores
        .runs
        .record(RunRecord::start("monitor", hash_str("monitor")).fail(FailureReason::Timeout, "timed out"))
        .unwrap();

    let failed: Vec<String> = stores
        .runs
        .query(RunFilter::default().status(RunState::Failed))
        .unwrap()
        .map(|r| r.stage_name)
        .collect();
    assert_eq!(failed, vec!["monitor"]);

    let mut all = stores.runs.query(RunFilter::default()).unwrap();
    assert_eq!(all.next().unwrap().stage_name, "preprocess");
    // a second query starts from the beginning
    assert_eq!(stores.runs.query(RunFilter::default()).unwrap().count(), 3);
    assert_eq!(all.count(), 2);

    let far_future = u64::MAX;
    assert_eq!(stores.runs.query(RunFilter::default().since(far_future)).unwrap().count(), 0);
}
