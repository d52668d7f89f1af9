//! Append-only run log.
//!
//! Every executed stage appends exactly one finalized `RunRecord`. Records are
//! persisted as JSON Lines (`runs.jsonl`) and mirrored in memory for queries.
//! Nothing is ever updated or removed.

use std::sync::{Arc, RwLock};

use ckdflow_core::error::{Error, Result};
use ckdflow_core::record::{RunRecord, RunState};

use crate::storage::Storage;

const LOG_KEY: &str = "runs.jsonl";

/// Filter for [`RunRegistry::query`]. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub stage: Option<String>,
    pub status: Option<RunState>,
    /// Only records started at or after this time (ms since epoch).
    pub since_ms: Option<u64>,
}

impl RunFilter {
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn status(mut self, status: RunState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    fn matches(&self, r: &RunRecord) -> bool {
        self.stage.as_deref().map_or(true, |s| r.stage_name == s)
            && self.status.map_or(true, |s| r.status.state() == s)
            && self.since_ms.map_or(true, |t| r.started_ms >= t)
    }
}

/// Lazy iterator over a snapshot of the log, ascending by start time.
///
/// Filtering and cloning happen as the iterator is advanced. Records appended
/// after the query was created are not visible to it; call `query` again for
/// a fresh sequence.
pub struct RunQuery {
    snapshot: Vec<Arc<RunRecord>>,
    pos: usize,
    filter: RunFilter,
}

impl Iterator for RunQuery {
    type Item = RunRecord;

    fn next(&mut self) -> Option<RunRecord> {
        while let Some(rec) = self.snapshot.get(self.pos) {
            self.pos += 1;
            if self.filter.matches(rec) {
                return Some(RunRecord::clone(rec));
            }
        }
        None
    }
}

pub struct RunRegistry {
    storage: Arc<dyn Storage>,
    records: RwLock<Vec<Arc<RunRecord>>>,
}

impl RunRegistry {
    /// Open the log, replaying existing records.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let mut records = Vec::new();
        if storage.exists(LOG_KEY)? {
            let bytes = storage.read(LOG_KEY)?;
            let text = String::from_utf8_lossy(&bytes);
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RunRecord>(line) {
                    Ok(rec) => records.push(Arc::new(rec)),
                    // A torn trailing line from an interrupted process is skipped.
                    Err(e) => tracing::warn!(line = lineno + 1, error = %e, "skipping unreadable run record"),
                }
            }
        }
        tracing::debug!(records = records.len(), "opened run registry");
        Ok(Self {
            storage,
            records: RwLock::new(records),
        })
    }

    pub fn empty(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Append a record. Safe under concurrent writers.
    pub fn record(&self, record: RunRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Invariant("run registry lock poisoned".into()))?;
        // Persist under the lock so the file order matches memory order.
        self.storage.append(LOG_KEY, &line)?;
        tracing::debug!(
            run_id = %record.run_id,
            stage = %record.stage_name,
            status = ?record.status.state(),
            "run recorded"
        );
        records.push(Arc::new(record));
        Ok(())
    }

    /// Filtered retrieval, ascending by `started_ms`.
    pub fn query(&self, filter: RunFilter) -> Result<RunQuery> {
        let mut snapshot: Vec<Arc<RunRecord>> = self
            .records
            .read()
            .map_err(|_| Error::Invariant("run registry lock poisoned".into()))?
            .clone();
        snapshot.sort_by_key(|r| r.started_ms);
        Ok(RunQuery {
            snapshot,
            pos: 0,
            filter,
        })
    }

    pub fn len(&self) -> usize {
        // The vector is only pushed to after a successful append, so a
        // poisoned guard still holds a complete log.
        match self.records.read() {
            Ok(r) => r.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recently started record for a stage, if any.
    pub fn latest(&self, stage: &str) -> Result<Option<RunRecord>> {
        Ok(self.query(RunFilter::default().stage(stage))?.last())
    }
}
