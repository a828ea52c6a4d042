use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::jobs::tracker::{JobLedger, LedgerError};
use crate::jobs::{JobRecord, JobStatus};
use crate::vendors::Integration;

/// SQLite mirror of the in-memory job map. Survives restarts so settled
/// jobs stay queryable after the process that ran them is gone.
#[derive(Debug, Clone)]
pub struct SqliteJobLedger {
    db_path: PathBuf,
}

impl SqliteJobLedger {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn initialize(&self) -> Result<(), LedgerError> {
        self.with_connection(|_| Ok(()))
    }

    pub fn fetch(&self, job_id: &str) -> Result<Option<JobRecord>, LedgerError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT job_id, integration, status, created_at, updated_at, error_message, results
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_record,
            )
            .optional()
            .map_err(|err| LedgerError::Write(err.to_string()))
        })
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())
            .map_err(|err| LedgerError::Open(err.to_string()))?;
        ensure_schema(&conn)?;
        func(&conn)
    }
}

impl JobLedger for SqliteJobLedger {
    /// Mirror writes arrive concurrently and may commit out of order; the
    /// updated-at guard drops any snapshot older than the stored row, so a
    /// late write can never regress a settled record. RFC 3339 UTC strings
    /// compare chronologically, which makes the guard a plain text compare.
    fn upsert(&self, record: &JobRecord) -> Result<(), LedgerError> {
        let results = serde_json::to_string(&record.results)
            .map_err(|err| LedgerError::Write(err.to_string()))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, integration, status, created_at, updated_at, error_message, results)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) DO UPDATE SET
                   status = excluded.status,
                   updated_at = excluded.updated_at,
                   error_message = excluded.error_message,
                   results = excluded.results
                 WHERE excluded.updated_at >= jobs.updated_at",
                params![
                    record.job_id,
                    record.integration.as_str(),
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.error_message,
                    results,
                ],
            )
            .map_err(|err| LedgerError::Write(err.to_string()))?;
            Ok(())
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
          job_id TEXT PRIMARY KEY,
          integration TEXT NOT NULL,
          status TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          error_message TEXT,
          results TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs (updated_at);
        ",
    )
    .map_err(|err| LedgerError::Open(err.to_string()))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let integration: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    let results: String = row.get(6)?;
    Ok(JobRecord {
        job_id: row.get(0)?,
        integration: Integration::from_slug(&integration).unwrap_or(Integration::ChatImage),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        error_message: row.get(5)?,
        results: serde_json::from_str(&results).unwrap_or_default(),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
