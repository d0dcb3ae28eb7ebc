//! Run registry
//!
//! Holds one record per run together with the handle of its live worker.
//!
//! # Design
//!
//! - DashMap: sharded by RunId, shard locks are held only for the map access
//! - One `parking_lot::Mutex` per record: transitions of the same run are
//!   serialized, different runs never contend
//! - `compare_and_transition` is the only mutation after `insert`; the
//!   worker completion path and the cancellation path both go through it,
//!   so exactly one of them finalizes a run
//! - Records are never removed

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::run_model::{RunId, RunRecord, RunStatus};
use crate::worker::WorkerHandle;
use crate::{Error, Result};

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    /// Present exactly while `record.status == Started`
    handle: Option<Arc<dyn WorkerHandle>>,
}

/// Result of an atomic status + handle read
#[derive(Debug, Clone)]
pub enum RunLookup {
    /// No record for this id
    Missing,
    /// Record exists and is final
    Terminal(RunStatus),
    /// Record is `STARTED`; the handle of its worker
    Active(Arc<dyn WorkerHandle>),
}

/// Concurrent run registry
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, Arc<Mutex<RunEntry>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, run_id: &RunId) -> Option<Arc<Mutex<RunEntry>>> {
        self.runs.get(run_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Register a record
    ///
    /// A `STARTED` record must come with its worker handle; a terminal one
    /// must be finished and carry none.
    pub fn insert(&self, record: RunRecord, handle: Option<Arc<dyn WorkerHandle>>) -> Result<()> {
        match (record.status.is_terminal(), handle.is_some()) {
            (false, false) => {
                return Err(Error::InvalidInput(format!(
                    "run {} is STARTED but has no worker handle",
                    record.run_id
                )))
            }
            (true, true) => {
                return Err(Error::InvalidInput(format!(
                    "run {} is {} but still has a worker handle",
                    record.run_id, record.status
                )))
            }
            (true, false) if record.finished_at.is_none() => {
                return Err(Error::InvalidInput(format!(
                    "run {} is {} but has no finish time",
                    record.run_id, record.status
                )))
            }
            _ => {}
        }

        match self.runs.entry(record.run_id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateRun(record.run_id.to_string())),
            Entry::Vacant(vacant) => {
                debug!("Registered run {} ({})", record.run_id, record.status);
                vacant.insert(Arc::new(Mutex::new(RunEntry { record, handle })));
                Ok(())
            }
        }
    }

    /// Snapshot of a record
    pub fn get(&self, run_id: &RunId) -> Option<RunRecord> {
        self.entry(run_id).map(|entry| entry.lock().record.clone())
    }

    /// Current status of a run
    pub fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.entry(run_id).map(|entry| entry.lock().record.status)
    }

    /// Read status and worker handle under the record lock
    pub fn lookup(&self, run_id: &RunId) -> RunLookup {
        let Some(entry) = self.entry(run_id) else {
            return RunLookup::Missing;
        };
        let entry = entry.lock();
        match (&entry.handle, entry.record.status) {
            (Some(handle), RunStatus::Started) => RunLookup::Active(Arc::clone(handle)),
            (_, status) => RunLookup::Terminal(status),
        }
    }

    /// Atomically move a run from `expected` to the terminal status `new`
    ///
    /// Returns `Ok(false)` when the current status is not `expected`, i.e.
    /// another path already finalized the run.
    pub fn compare_and_transition(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        new: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !expected.can_transition_to(new) {
            return Err(Error::InvalidTransition {
                run_id: run_id.to_string(),
                from: expected,
                to: new,
            });
        }

        let entry = self
            .entry(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

        let released = {
            let mut entry = entry.lock();
            if entry.record.status != expected {
                debug!(
                    "Run {} is {}, not {}; {} transition lost",
                    run_id, entry.record.status, expected, new
                );
                return Ok(false);
            }
            entry.record.finish(new, finished_at);
            entry.handle.take()
        };
        // Handle is dropped outside the record lock.
        drop(released);

        debug!("Run {} transitioned {} -> {}", run_id, expected, new);
        Ok(true)
    }

    /// Snapshots of all records, oldest first
    pub fn list(&self) -> Vec<RunRecord> {
        let entries: Vec<_> = self
            .runs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut records: Vec<RunRecord> = entries
            .iter()
            .map(|entry| entry.lock().record.clone())
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
