//! SQLite progress backend

use crate::progress::backend::{ProgressBackend, StorageError, StorageResult};
use crate::progress::schema::initialize_schema;
use crate::progress::{ProgressRecord, RunRecord, RunStats, RunStatus};
use crate::state::UnitStatus;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite-backed progress storage
pub struct SqliteProgressBackend {
    conn: Connection,
}

impl SqliteProgressBackend {
    /// Opens or creates the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteProgressBackend)` - Database opened and schema initialized
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp '{}': {}", raw, e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
    })
}

impl ProgressBackend for SqliteProgressBackend {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    // ===== Unit Progress =====

    fn load_records(&self) -> StorageResult<Vec<ProgressRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT unit_id, status, updated_at FROM unit_progress")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (unit_id, status, updated_at) = row?;
            let status = UnitStatus::from_db_string(&status).ok_or_else(|| {
                StorageError::Serialization(format!("unknown status '{}' for {}", status, unit_id))
            })?;
            records.push(ProgressRecord {
                unit_id,
                status,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(records)
    }

    fn persist(&mut self, records: &[ProgressRecord], stats: &RunStats) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO unit_progress (unit_id, status, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(unit_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            )?;
            for record in records {
                upsert.execute(params![
                    record.unit_id,
                    record.status.to_db_string(),
                    record.updated_at.to_rfc3339()
                ])?;
            }

            tx.execute(
                "INSERT INTO run_stats (id, processed, succeeded, failed, retried, items_produced, started_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    processed = excluded.processed,
                    succeeded = excluded.succeeded,
                    failed = excluded.failed,
                    retried = excluded.retried,
                    items_produced = excluded.items_produced,
                    started_at = excluded.started_at",
                params![
                    stats.processed as i64,
                    stats.succeeded as i64,
                    stats.failed as i64,
                    stats.retried as i64,
                    stats.items_produced as i64,
                    stats.started_at.to_rfc3339()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ===== Statistics =====

    fn load_stats(&self) -> StorageResult<Option<RunStats>> {
        let row = self
            .conn
            .query_row(
                "SELECT processed, succeeded, failed, retried, items_produced, started_at
                 FROM run_stats WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((processed, succeeded, failed, retried, items_produced, started_at)) = row else {
            return Ok(None);
        };

        Ok(Some(RunStats {
            processed: processed.max(0) as u64,
            succeeded: succeeded.max(0) as u64,
            failed: failed.max(0) as u64,
            retried: retried.max(0) as u64,
            items_produced: items_produced.max(0) as u64,
            started_at: parse_timestamp(&started_at)?,
        }))
    }

    fn reset(&mut self) -> StorageResult<()> {
        self.conn
            .execute_batch("DELETE FROM unit_progress; DELETE FROM run_stats;")?;
        Ok(())
    }
}
