//! Progress module for crash-resumable scrapes
//!
//! This module keeps the durable record of the run, including:
//! - Per-unit status (success, failed, pending)
//! - Aggregate statistics, cumulative across resumed runs
//! - Run records with the hash of the configuration they used
//! - Buffered, periodic flushing through `ProgressStore`

mod backend;
mod memory;
mod schema;
mod sqlite;
mod stats;
mod store;

pub use backend::{ProgressBackend, StorageError, StorageResult};
pub use memory::MemoryProgressBackend;
pub use sqlite::SqliteProgressBackend;
pub use stats::{load_statistics, print_statistics, RunStats, Statistics, StatusCounts};
pub use store::ProgressStore;

use crate::state::UnitStatus;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

/// Opens a SQLite-backed progress store
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
/// * `flush_every` - Terminal outcomes between automatic flushes
/// * `flush_interval` - Maximum time between automatic flushes
pub fn open_progress(
    path: &Path,
    flush_every: u32,
    flush_interval: Duration,
) -> StorageResult<ProgressStore> {
    let backend = SqliteProgressBackend::new(path)?;
    ProgressStore::open(backend, flush_every, flush_interval)
}

/// Persisted status of one work unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub unit_id: String,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
}

/// Represents a scrape run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a scrape run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
