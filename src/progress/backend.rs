//! Progress backend trait and error types
//!
//! A backend is the durable key-value store behind the `ProgressStore`. It is
//! written to in batches and read once at startup.

use crate::progress::{ProgressRecord, RunRecord, RunStats, RunStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable storage for unit progress, aggregate statistics and run records
pub trait ProgressBackend: Send {
    // ===== Run Management =====

    /// Creates a new run record in the `running` state
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Sets the final status and finish timestamp of a run
    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    // ===== Unit Progress =====

    /// Loads every persisted unit record
    fn load_records(&self) -> StorageResult<Vec<ProgressRecord>>;

    /// Upserts `records` and replaces the statistics, atomically
    fn persist(&mut self, records: &[ProgressRecord], stats: &RunStats) -> StorageResult<()>;

    // ===== Statistics =====

    /// Loads the aggregate statistics, if any were persisted
    fn load_stats(&self) -> StorageResult<Option<RunStats>>;

    /// Deletes all unit records and statistics (runs are kept)
    fn reset(&mut self) -> StorageResult<()>;
}
