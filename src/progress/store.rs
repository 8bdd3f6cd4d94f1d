//! Progress store: the durable record of which units are done
//!
//! Workers record outcomes concurrently; every call is serialized through one
//! mutex. Records are buffered and written to the backend in batches: after
//! a fixed number of terminal outcomes, after a fixed interval, and whenever
//! `flush` is called explicitly (shutdown, cancellation, fatal abort).

use crate::progress::backend::{ProgressBackend, StorageResult};
use crate::progress::stats::{RunStats, StatusCounts};
use crate::progress::{MemoryProgressBackend, ProgressRecord, RunRecord, RunStatus};
use crate::state::UnitStatus;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct StoreState {
    backend: Box<dyn ProgressBackend>,
    records: HashMap<String, ProgressRecord>,
    dirty: HashSet<String>,
    stats: RunStats,
    since_flush: u32,
    last_flush: Instant,
    flushes: u64,
    run_id: Option<i64>,
}

impl StoreState {
    fn new(backend: Box<dyn ProgressBackend>) -> Self {
        Self {
            backend,
            records: HashMap::new(),
            dirty: HashSet::new(),
            stats: RunStats::new(),
            since_flush: 0,
            last_flush: Instant::now(),
            flushes: 0,
            run_id: None,
        }
    }
}

/// Buffered, serialized access to a progress backend
pub struct ProgressStore {
    state: Mutex<StoreState>,
    flush_every: u32,
    flush_interval: Duration,
}

impl ProgressStore {
    /// Opens a store over `backend` and loads what it already holds
    ///
    /// # Arguments
    ///
    /// * `backend` - Durable storage
    /// * `flush_every` - Terminal outcomes between automatic flushes
    /// * `flush_interval` - Maximum time between automatic flushes
    pub fn open(
        backend: impl ProgressBackend + 'static,
        flush_every: u32,
        flush_interval: Duration,
    ) -> StorageResult<Self> {
        let mut state = StoreState::new(Box::new(backend));
        load_into(&mut state)?;

        Ok(Self {
            state: Mutex::new(state),
            flush_every: flush_every.max(1),
            flush_interval,
        })
    }

    /// A store over a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::new(Box::new(MemoryProgressBackend::new()))),
            flush_every: 10,
            flush_interval: Duration::from_secs(30),
        }
    }

    /// Reloads records and statistics from the backend
    ///
    /// Unflushed changes are discarded.
    ///
    /// # Returns
    ///
    /// The number of units already marked succeeded
    pub async fn load(&self) -> StorageResult<usize> {
        let mut state = self.state.lock().await;
        load_into(&mut state)
    }

    /// True when `unit_id` has already succeeded
    pub async fn is_done(&self, unit_id: &str) -> bool {
        self.state
            .lock()
            .await
            .records
            .get(unit_id)
            .is_some_and(|record| record.status.is_success())
    }

    pub async fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.state
            .lock()
            .await
            .records
            .get(unit_id)
            .map(|record| record.status)
    }

    /// Marks a unit succeeded; a later failure cannot downgrade it
    pub async fn record_success(&self, unit_id: &str, items: u64) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let previous = state.records.get(unit_id).map(|record| record.status);
        if previous == Some(UnitStatus::Success) {
            return Ok(());
        }

        match previous {
            Some(UnitStatus::Failed) => state.stats.failed = state.stats.failed.saturating_sub(1),
            _ => state.stats.processed += 1,
        }
        state.stats.succeeded += 1;
        state.stats.items_produced += items;
        set_status(&mut state, unit_id, UnitStatus::Success);

        self.after_terminal(&mut state)
    }

    /// Marks a unit failed (rejected or abandoned)
    pub async fn record_failure(&self, unit_id: &str) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let terminal = state
            .records
            .get(unit_id)
            .is_some_and(|record| record.status.is_terminal());
        if terminal {
            return Ok(());
        }

        state.stats.processed += 1;
        state.stats.failed += 1;
        set_status(&mut state, unit_id, UnitStatus::Failed);

        self.after_terminal(&mut state)
    }

    /// Notes a unit that was seen but not resolved
    ///
    /// Has no effect on units that already have a terminal status.
    pub async fn record_pending(&self, unit_id: &str) {
        let mut state = self.state.lock().await;
        let terminal = state
            .records
            .get(unit_id)
            .is_some_and(|record| record.status.is_terminal());
        if !terminal {
            set_status(&mut state, unit_id, UnitStatus::Pending);
        }
    }

    /// Counts one retried or requeued attempt
    pub async fn record_retry(&self) {
        self.state.lock().await.stats.retried += 1;
    }

    /// Writes buffered records and statistics to the backend
    pub async fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        flush_locked(&mut state)
    }

    pub async fn stats(&self) -> RunStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn status_counts(&self) -> StatusCounts {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for record in state.records.values() {
            counts.add(record.status);
        }
        counts
    }

    /// Ids currently recorded with `status`
    pub async fn ids_with_status(&self, status: UnitStatus) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .records
            .values()
            .filter(|record| record.status == status)
            .map(|record| record.unit_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of flushes performed so far
    pub async fn flush_count(&self) -> u64 {
        self.state.lock().await.flushes
    }

    // ===== Run Management =====

    /// Creates the run record for this process
    pub async fn begin_run(&self, config_hash: &str) -> StorageResult<i64> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.backend.get_latest_run()? {
            if previous.status == RunStatus::Running {
                tracing::warn!(
                    "Previous run {} did not finish cleanly, resuming its progress",
                    previous.id
                );
                state.backend.finish_run(previous.id, RunStatus::Interrupted)?;
            }
            if previous.config_hash != config_hash {
                tracing::info!("Configuration changed since run {}", previous.id);
            }
        }
        let run_id = state.backend.create_run(config_hash)?;
        state.run_id = Some(run_id);
        tracing::info!("Started run {}", run_id);
        Ok(run_id)
    }

    /// Flushes and closes the current run record
    pub async fn finish_run(&self, status: RunStatus) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        flush_locked(&mut state)?;
        if let Some(run_id) = state.run_id.take() {
            state.backend.finish_run(run_id, status)?;
            tracing::info!("Run {} finished as {}", run_id, status.to_db_string());
        }
        Ok(())
    }

    pub async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        self.state.lock().await.backend.get_latest_run()
    }

    /// Forgets all progress, in memory and in the backend
    pub async fn reset(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.backend.reset()?;
        state.records.clear();
        state.dirty.clear();
        state.stats = RunStats::new();
        state.since_flush = 0;
        tracing::info!("Progress reset");
        Ok(())
    }

    fn after_terminal(&self, state: &mut StoreState) -> StorageResult<()> {
        state.since_flush += 1;
        if state.since_flush >= self.flush_every || state.last_flush.elapsed() >= self.flush_interval
        {
            flush_locked(state)?;
        }
        Ok(())
    }
}

fn set_status(state: &mut StoreState, unit_id: &str, status: UnitStatus) {
    state.records.insert(
        unit_id.to_string(),
        ProgressRecord {
            unit_id: unit_id.to_string(),
            status,
            updated_at: Utc::now(),
        },
    );
    state.dirty.insert(unit_id.to_string());
}

fn load_into(state: &mut StoreState) -> StorageResult<usize> {
    let records = state.backend.load_records()?;
    state.records = records
        .into_iter()
        .map(|record| (record.unit_id.clone(), record))
        .collect();
    state.dirty.clear();
    state.since_flush = 0;
    if let Some(stats) = state.backend.load_stats()? {
        state.stats = stats;
    }

    let done = state
        .records
        .values()
        .filter(|record| record.status.is_success())
        .count();
    tracing::info!(
        "Loaded progress: {} units recorded, {} already succeeded",
        state.records.len(),
        done
    );
    Ok(done)
}

fn flush_locked(state: &mut StoreState) -> StorageResult<()> {
    let records: Vec<ProgressRecord> = state
        .dirty
        .iter()
        .filter_map(|id| state.records.get(id).cloned())
        .collect();
    state.backend.persist(&records, &state.stats)?;
    state.dirty.clear();
    state.since_flush = 0;
    state.last_flush = Instant::now();
    state.flushes += 1;
    tracing::debug!("Flushed {} progress records", records.len());
    Ok(())
}
