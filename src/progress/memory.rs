//! In-memory progress backend
//!
//! Clones share the same state, so a test can hand one clone to a store,
//! drop the store and open a new one on another clone to simulate a restart.

use crate::progress::backend::{ProgressBackend, StorageError, StorageResult};
use crate::progress::{ProgressRecord, RunRecord, RunStats, RunStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, ProgressRecord>,
    stats: Option<RunStats>,
    runs: Vec<RunRecord>,
    persist_calls: usize,
}

/// Volatile backend, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProgressBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the backend, as if an earlier run had persisted `records`
    pub fn with_records(records: impl IntoIterator<Item = ProgressRecord>) -> Self {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            for record in records {
                state.records.insert(record.unit_id.clone(), record);
            }
        }
        backend
    }

    /// Number of `persist` calls so far
    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    /// Every run record, oldest first
    pub fn runs(&self) -> Vec<RunRecord> {
        self.lock().runs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the maps half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressBackend for MemoryProgressBackend {
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let mut state = self.lock();
        let id = state.runs.len() as i64 + 1;
        state.runs.push(RunRecord {
            id,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            config_hash: config_hash.to_string(),
            status: RunStatus::Running,
        });
        Ok(id)
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        run.status = status;
        run.finished_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        Ok(self.lock().runs.last().cloned())
    }

    fn load_records(&self) -> StorageResult<Vec<ProgressRecord>> {
        Ok(self.lock().records.values().cloned().collect())
    }

    fn persist(&mut self, records: &[ProgressRecord], stats: &RunStats) -> StorageResult<()> {
        let mut state = self.lock();
        for record in records {
            state.records.insert(record.unit_id.clone(), record.clone());
        }
        state.stats = Some(stats.clone());
        state.persist_calls += 1;
        Ok(())
    }

    fn load_stats(&self) -> StorageResult<Option<RunStats>> {
        Ok(self.lock().stats.clone())
    }

    fn reset(&mut self) -> StorageResult<()> {
        let mut state = self.lock();
        state.records.clear();
        state.stats = None;
        Ok(())
    }
}
