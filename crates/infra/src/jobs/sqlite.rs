//! SQLite-backed job store.
//!
//! Several processes can share one database file; the conditional `UPDATE` in
//! [`SqliteJobStore::acquire_lease`] is what keeps two of them from claiming
//! the same job. Timestamps are stored as Unix milliseconds.
//!
//! ## Thread Safety
//!
//! The store owns a small multi-thread tokio runtime and exposes a blocking API
//! on top of it. It is `Send + Sync` and can be called from many threads at
//! once, but never from inside another tokio runtime.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Row, SqlitePool};
use tokio::runtime::Runtime;
use tracing::debug;

use jobforge_core::{JobId, PersonId};
use jobforge_jobs::{Job, JobError, JobStatus};

use super::store::{JobStats, JobStore, JobStoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_JOBS: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id                 TEXT PRIMARY KEY,
        kind               TEXT NOT NULL,
        payload            TEXT NOT NULL,
        status             TEXT NOT NULL,
        requester          TEXT NULL,
        created_at_ms      INTEGER NOT NULL,
        date_started_ms    INTEGER NULL,
        date_finished_ms   INTEGER NULL,
        lease_expires_ms   INTEGER NULL,
        scheduled_start_ms INTEGER NULL,
        attempt_count      INTEGER NOT NULL DEFAULT 0
    )
"#;

const CREATE_READY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS jobs_ready ON jobs (status, scheduled_start_ms)";

const SELECT_JOB: &str = r#"
    SELECT id, kind, payload, status, requester, created_at_ms, date_started_ms,
           date_finished_ms, lease_expires_ms, scheduled_start_ms, attempt_count
    FROM jobs
    WHERE id = ?
"#;

#[derive(Debug)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    runtime: Runtime,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `database_url` and ensure the
    /// schema exists.
    ///
    /// `sqlite::memory:` gives a private database that lives as long as the
    /// store.
    pub fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobforge-sqlite")
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::Storage(format!("failed to start sqlite runtime: {e}")))?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| map_sqlx_error("parse_database_url", e))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = runtime.block_on(async {
            let pool = pool_options
                .connect_with(options)
                .await
                .map_err(|e| map_sqlx_error("connect", e))?;
            migrate(&pool).await?;
            Ok::<_, JobStoreError>(pool)
        })?;

        debug!(database_url, "sqlite job store ready");
        Ok(Self { pool, runtime })
    }

    pub fn in_memory() -> Result<Self, JobStoreError> {
        Self::connect("sqlite::memory:")
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        sqlx::query_as::<_, JobRow>(SELECT_JOB)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?
            .map(Job::try_from)
            .transpose()
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), JobStoreError> {
    sqlx::query(CREATE_JOBS)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_table", e))?;
    sqlx::query(CREATE_READY_INDEX)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("create_ready_index", e))?;
    Ok(())
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let id = job.id;
        let insert = insert_query(&job)?;
        self.block_on(async {
            insert
                .execute(&self.pool)
                .await
                .map_err(|e| map_insert_error(id, e))
        })?;
        Ok(id)
    }

    fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        let inserts = jobs
            .iter()
            .map(|job| Ok((job.id, insert_query(job)?)))
            .collect::<Result<Vec<_>, JobStoreError>>()?;

        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let mut ids = Vec::with_capacity(inserts.len());
            for (id, insert) in inserts {
                insert
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_insert_error(id, e))?;
                ids.push(id);
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(ids)
        })
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.fetch_job(id))
    }

    fn ready_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let now = Utc::now().timestamp_millis();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self.block_on(
            sqlx::query(
                r#"
                SELECT id FROM jobs
                WHERE status = ?
                  AND (lease_expires_ms IS NULL OR lease_expires_ms <= ?)
                  AND (scheduled_start_ms IS NULL OR scheduled_start_ms <= ?)
                ORDER BY COALESCE(scheduled_start_ms, created_at_ms), id
                LIMIT ?
                "#,
            )
            .bind(JobStatus::Waiting.as_str())
            .bind(now)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .map_err(|e| map_sqlx_error("ready_job_ids", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| map_sqlx_error("ready_job_ids", e))?;
                parse_job_id(&id)
            })
            .collect()
    }

    fn acquire_lease(&self, id: JobId, duration: chrono::Duration) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(duration)
            .ok_or(JobError::LeaseOutOfRange { job_id: id, duration })?;

        self.block_on(async {
            let claimed = sqlx::query(
                r#"
                UPDATE jobs SET lease_expires_ms = ?
                WHERE id = ?
                  AND (lease_expires_ms IS NULL OR lease_expires_ms <= ?)
                "#,
            )
            .bind(expires_at.timestamp_millis())
            .bind(id.to_string())
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire_lease", e))?
            .rows_affected()
                == 1;

            let job = self.fetch_job(id).await?.ok_or(JobStoreError::NotFound(id))?;
            if claimed {
                debug!(job_id = %id, %expires_at, "lease acquired");
                return Ok(job);
            }

            Err(JobError::LeaseAlreadyHeld {
                job_id: id,
                expires_at: job.lease_expires.unwrap_or(now),
            }
            .into())
        })
    }

    fn save(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let columns = JobColumns::from_job(job)?;

        self.block_on(async {
            let updated = sqlx::query(
                r#"
                UPDATE jobs
                SET kind = ?, payload = ?, status = ?, requester = ?,
                    date_started_ms = ?, date_finished_ms = ?, lease_expires_ms = ?,
                    scheduled_start_ms = ?, attempt_count = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(columns.kind)
            .bind(columns.payload)
            .bind(columns.status)
            .bind(columns.requester)
            .bind(columns.date_started_ms)
            .bind(columns.date_finished_ms)
            .bind(columns.lease_expires_ms)
            .bind(columns.scheduled_start_ms)
            .bind(columns.attempt_count)
            .bind(columns.id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?
            .rows_affected();

            if updated == 1 {
                return Ok(());
            }

            match self.fetch_job(job.id).await? {
                None => Err(JobStoreError::NotFound(job.id)),
                Some(stored) => Err(JobStoreError::Stale {
                    job_id: job.id,
                    expected,
                    actual: stored.status,
                }),
            }
        })
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = self
            .block_on(
                sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(parse_status(&status)?, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Column values of one job row, ready to bind.
struct JobColumns {
    id: String,
    kind: String,
    payload: String,
    status: &'static str,
    requester: Option<String>,
    created_at_ms: i64,
    date_started_ms: Option<i64>,
    date_finished_ms: Option<i64>,
    lease_expires_ms: Option<i64>,
    scheduled_start_ms: Option<i64>,
    attempt_count: i64,
}

impl JobColumns {
    fn from_job(job: &Job) -> Result<Self, JobStoreError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        Ok(Self {
            id: job.id.to_string(),
            kind: job.kind.clone(),
            payload,
            status: job.status.as_str(),
            requester: job.requester.map(|p| p.to_string()),
            created_at_ms: job.created_at.timestamp_millis(),
            date_started_ms: job.date_started.map(|t| t.timestamp_millis()),
            date_finished_ms: job.date_finished.map(|t| t.timestamp_millis()),
            lease_expires_ms: job.lease_expires.map(|t| t.timestamp_millis()),
            scheduled_start_ms: job.scheduled_start.map(|t| t.timestamp_millis()),
            attempt_count: i64::from(job.attempt_count),
        })
    }
}

fn insert_query(job: &Job) -> Result<Query<'static, Sqlite, SqliteArguments<'static>>, JobStoreError> {
    let columns = JobColumns::from_job(job)?;
    Ok(sqlx::query(
        r#"
        INSERT INTO jobs (id, kind, payload, status, requester, created_at_ms, date_started_ms,
                          date_finished_ms, lease_expires_ms, scheduled_start_ms, attempt_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(columns.id)
    .bind(columns.kind)
    .bind(columns.payload)
    .bind(columns.status)
    .bind(columns.requester)
    .bind(columns.created_at_ms)
    .bind(columns.date_started_ms)
    .bind(columns.date_finished_ms)
    .bind(columns.lease_expires_ms)
    .bind(columns.scheduled_start_ms)
    .bind(columns.attempt_count))
}

#[derive(Debug)]
struct JobRow {
    id: String,
    kind: String,
    payload: String,
    status: String,
    requester: Option<String>,
    created_at_ms: i64,
    date_started_ms: Option<i64>,
    date_finished_ms: Option<i64>,
    lease_expires_ms: Option<i64>,
    scheduled_start_ms: Option<i64>,
    attempt_count: i64,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            requester: row.try_get("requester")?,
            created_at_ms: row.try_get("created_at_ms")?,
            date_started_ms: row.try_get("date_started_ms")?,
            date_finished_ms: row.try_get("date_finished_ms")?,
            lease_expires_ms: row.try_get("lease_expires_ms")?,
            scheduled_start_ms: row.try_get("scheduled_start_ms")?,
            attempt_count: row.try_get("attempt_count")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let payload: Value = serde_json::from_str(&row.payload)
            .map_err(|e| JobStoreError::Storage(format!("corrupt payload for job {}: {e}", row.id)))?;
        let requester = row
            .requester
            .as_deref()
            .map(PersonId::from_str)
            .transpose()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        Ok(Job {
            id: parse_job_id(&row.id)?,
            kind: row.kind,
            payload,
            status: parse_status(&row.status)?,
            requester,
            created_at: from_millis(row.created_at_ms)?,
            date_started: row.date_started_ms.map(from_millis).transpose()?,
            date_finished: row.date_finished_ms.map(from_millis).transpose()?,
            lease_expires: row.lease_expires_ms.map(from_millis).transpose()?,
            scheduled_start: row.scheduled_start_ms.map(from_millis).transpose()?,
            attempt_count: u32::try_from(row.attempt_count).map_err(|_| {
                JobStoreError::Storage(format!("bad attempt_count for job {}", row.id))
            })?,
        })
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, JobStoreError> {
    JobId::from_str(raw).map_err(|e| JobStoreError::Storage(e.to_string()))
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::from_str(raw).map_err(|e| JobStoreError::Storage(e.to_string()))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Storage(format!("timestamp out of range: {ms}")))
}

fn map_insert_error(id: JobId, err: sqlx::Error) -> JobStoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            JobStoreError::AlreadyExists(id)
        }
        _ => map_sqlx_error("insert_job", err),
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
