//! SQLite-backed metadata store.
//!
//! Rows are stored one per job id. Timestamps are RFC 3339 strings with
//! microsecond precision so lexical order equals chronological order.
//! Partial updates read the row, merge through [`TranscriptionJob::apply`] and
//! write it back inside one transaction.
//!
//! Writes open with `BEGIN IMMEDIATE` so the write lock is taken before the
//! read. Concurrent writers then queue on `busy_timeout` instead of failing
//! with `SQLITE_BUSY` when a deferred read lock cannot be upgraded, and a
//! writer that loses the race to a terminal state sees `Unchanged`.

use super::{MetadataStore, StoreError, UpdateOutcome};
use crate::jobs::model::{JobPatch, JobStatus, TranscriptionJob};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                 TEXT PRIMARY KEY NOT NULL,
    job_name           TEXT,
    original_file_name TEXT NOT NULL,
    source             TEXT NOT NULL,
    status             TEXT NOT NULL,
    text               TEXT,
    confidence         REAL,
    duration_seconds   REAL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    completed_at       TEXT,
    audio_object_key   TEXT,
    error              TEXT,
    orphaned           INTEGER NOT NULL DEFAULT 0
)
"#;

const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at DESC)";

const UPSERT: &str = r#"
INSERT INTO jobs (
    id, job_name, original_file_name, source, status, text, confidence,
    duration_seconds, created_at, updated_at, completed_at, audio_object_key,
    error, orphaned
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    job_name = excluded.job_name,
    original_file_name = excluded.original_file_name,
    source = excluded.source,
    status = excluded.status,
    text = excluded.text,
    confidence = excluded.confidence,
    duration_seconds = excluded.duration_seconds,
    created_at = excluded.created_at,
    updated_at = excluded.updated_at,
    completed_at = excluded.completed_at,
    audio_object_key = excluded.audio_object_key,
    error = excluded.error,
    orphaned = excluded.orphaned
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_name: Option<String>,
    original_file_name: String,
    source: String,
    status: String,
    text: Option<String>,
    confidence: Option<f64>,
    duration_seconds: Option<f64>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    audio_object_key: Option<String>,
    error: Option<String>,
    orphaned: bool,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", field, raw, e)))
}

impl TryFrom<JobRow> for TranscriptionJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(TranscriptionJob {
            source: row.source.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|raw| parse_timestamp("completed_at", raw))
                .transpose()?,
            id: row.id,
            job_name: row.job_name,
            original_file_name: row.original_file_name,
            text: row.text,
            confidence: row.confidence,
            duration_seconds: row.duration_seconds,
            audio_object_key: row.audio_object_key,
            error: row.error,
            orphaned: row.orphaned,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<TranscriptionJob>, StoreError> {
    rows.into_iter().map(TranscriptionJob::try_from).collect()
}

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Connect to `database_url`, creating the file and schema if needed.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            let path = path.trim_start_matches("//");
            if !path.starts_with(":memory:") {
                if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query(STATUS_INDEX).execute(&pool).await?;
        info!(database_url, "Metadata store ready");

        Ok(Self { pool })
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin_with(BEGIN_WRITE).await?)
    }

    async fn fetch_in<'c>(
        tx: &mut Transaction<'c, Sqlite>,
        id: &str,
    ) -> Result<Option<TranscriptionJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(TranscriptionJob::try_from).transpose()
    }

    async fn upsert_in<'c>(tx: &mut Transaction<'c, Sqlite>, job: &TranscriptionJob) -> Result<(), StoreError> {
        sqlx::query(UPSERT)
            .bind(&job.id)
            .bind(&job.job_name)
            .bind(&job.original_file_name)
            .bind(job.source.as_str())
            .bind(job.status.as_str())
            .bind(&job.text)
            .bind(job.confidence)
            .bind(job.duration_seconds)
            .bind(format_timestamp(&job.created_at))
            .bind(format_timestamp(&job.updated_at))
            .bind(job.completed_at.as_ref().map(format_timestamp))
            .bind(&job.audio_object_key)
            .bind(&job.error)
            .bind(job.orphaned)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn put_record(&self, job: &TranscriptionJob) -> Result<(), StoreError> {
        let mut tx = self.begin_write().await?;
        Self::upsert_in(&mut tx, job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<TranscriptionJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TranscriptionJob::try_from).transpose()
    }

    async fn update_fields(&self, id: &str, patch: &JobPatch) -> Result<UpdateOutcome, StoreError> {
        let mut tx = self.begin_write().await?;
        let Some(mut job) = Self::fetch_in(&mut tx, id).await? else {
            return Ok(UpdateOutcome::Missing);
        };

        if !job.apply(patch, Utc::now()) {
            return Ok(UpdateOutcome::Unchanged(job));
        }

        Self::upsert_in(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(UpdateOutcome::Updated(job))
    }

    async fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<TranscriptionJob>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, id ASC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY created_at DESC, id ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        into_jobs(rows)
    }

    async fn scan_in_progress(&self) -> Result<Vec<TranscriptionJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, id ASC",
        )
        .bind(JobStatus::InProgress.as_str())
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }
}
