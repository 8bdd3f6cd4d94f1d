//! Aggregate statistics and their console rendering

use crate::progress::backend::{ProgressBackend, StorageResult};
use crate::progress::RunRecord;
use crate::state::UnitStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate counters, cumulative across resumed runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Units that reached a terminal status
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Attempts that were retried or requeued
    pub retried: u64,
    /// Sub-items produced by successful units
    pub items_produced: u64,
    pub started_at: DateTime<Utc>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            items_produced: 0,
            started_at: Utc::now(),
        }
    }

    /// Share of processed units that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64 * 100.0
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of unit records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: u64,
    pub failed: u64,
    pub pending: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: UnitStatus) {
        match status {
            UnitStatus::Success => self.success += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::Pending => self.pending += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.failed + self.pending
    }
}

/// Everything `--stats` shows
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub stats: RunStats,
    pub counts: StatusCounts,
    #[serde(skip)]
    pub latest_run: Option<RunRecord>,
}

/// Loads statistics straight from a backend
///
/// # Arguments
///
/// * `backend` - The backend to query
///
/// # Returns
///
/// * `Ok(Statistics)` - Persisted counters, per-status counts and the latest run
/// * `Err(StorageError)` - Failed to query the backend
pub fn load_statistics(backend: &dyn ProgressBackend) -> StorageResult<Statistics> {
    let stats = backend.load_stats()?.unwrap_or_default();

    let mut counts = StatusCounts::default();
    for record in backend.load_records()? {
        counts.add(record.status);
    }

    let latest_run = backend.get_latest_run()?;

    Ok(Statistics {
        stats,
        counts,
        latest_run,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(statistics: &Statistics) {
    let stats = &statistics.stats;
    let counts = &statistics.counts;

    println!("=== Scrape Statistics ===\n");

    println!("Overview:");
    println!("  Started: {}", stats.started_at.to_rfc3339());
    println!("  Units processed: {}", stats.processed);
    println!(
        "  Succeeded: {} ({:.1}%)",
        stats.succeeded,
        stats.success_rate()
    );
    println!("  Failed: {}", stats.failed);
    println!("  Retries: {}", stats.retried);
    println!("  Items produced: {}", stats.items_produced);
    println!();

    println!("Units by Status:");
    for (label, count) in [
        ("success", counts.success),
        ("failed", counts.failed),
        ("pending", counts.pending),
    ] {
        let percentage = if counts.total() > 0 {
            count as f64 / counts.total() as f64 * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", label, count, percentage);
    }
    println!();

    if let Some(run) = &statistics.latest_run {
        println!("Latest Run:");
        println!("  ID: {}", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        println!("  Config hash: {}", run.config_hash);
    }
}
