//! SQLite implementation of JobBackend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;

use super::store::{BackendError, ClaimedJob, JobBackend, JobId, JobState, JobStatus, JobType, NewJob};
use crate::retry::RetryPolicy;

/// SQLite-backed job backend.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SqliteBackend.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the jobs table.
    pub async fn run_migrations(&self) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lf_jobs (
                id INTEGER PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting',
                progress INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error_message TEXT,
                available_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_lf_jobs_claim
            ON lf_jobs(job_type, state, available_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn set_terminal(
        &self,
        id: JobId,
        state: JobState,
        result: Option<String>,
        error: Option<&str>,
    ) -> Result<(), BackendError> {
        let updated = sqlx::query(
            r#"
            UPDATE lf_jobs
            SET state = ?, result = ?, error_message = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(result)
        .bind(error.map(truncate))
        .bind(Utc::now())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 0 {
            return Err(BackendError::NotFound(id));
        }
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> BackendError {
    BackendError::StorageError(e.to_string())
}

fn truncate(error: &str) -> &str {
    match error.char_indices().nth(2000) {
        Some((idx, _)) => &error[..idx],
        None => error,
    }
}

#[async_trait]
impl JobBackend for SqliteBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;
        let retry = serde_json::to_string(&job.retry)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;
        let now = Utc::now();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO lf_jobs (job_type, payload, retry, available_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(payload)
        .bind(retry)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(JobId(id))
    }

    async fn claim(&self, job_type: JobType) -> Result<Option<ClaimedJob>, BackendError> {
        // A single UPDATE ... RETURNING is atomic, so two workers never
        // receive the same row.
        let now = Utc::now();
        let row = sqlx::query_as::<_, (i64, String, String, i64)>(
            r#"
            UPDATE lf_jobs
            SET state = 'active', attempts = attempts + 1, started_at = ?
            WHERE id = (
                SELECT id FROM lf_jobs
                WHERE state = 'waiting' AND job_type = ? AND available_at <= ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, payload, retry, attempts
            "#,
        )
        .bind(now)
        .bind(job_type.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some((id, payload, retry, attempts)) = row else {
            return Ok(None);
        };

        let payload = serde_json::from_str(&payload)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;
        let retry: RetryPolicy = serde_json::from_str(&retry)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;

        Ok(Some(ClaimedJob {
            id: JobId(id),
            job_type,
            payload,
            attempt: attempts.max(1) as u32,
            retry,
        }))
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError> {
        sqlx::query("UPDATE lf_jobs SET progress = ? WHERE id = ?")
            .bind(progress.min(100) as i64)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<(), BackendError> {
        let result = serde_json::to_string(&result)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;
        self.set_terminal(id, JobState::Completed, Some(result), None)
            .await
    }

    async fn retry_later(
        &self,
        id: JobId,
        error: &str,
        delay: Duration,
    ) -> Result<(), BackendError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| BackendError::SerializationError(e.to_string()))?;
        let available_at: DateTime<Utc> = Utc::now() + delay;

        let updated = sqlx::query(
            r#"
            UPDATE lf_jobs
            SET state = 'waiting', error_message = ?, available_at = ?, started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(truncate(error))
        .bind(available_at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 0 {
            return Err(BackendError::NotFound(id));
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), BackendError> {
        self.set_terminal(id, JobState::Failed, None, Some(error))
            .await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobStatus>, BackendError> {
        let row = sqlx::query_as::<_, (String, i64, i64, Option<String>, Option<String>)>(
            "SELECT state, progress, attempts, result, error_message FROM lf_jobs WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|(state, progress, attempts, result, error)| {
            let result = result
                .map(|r| serde_json::from_str(&r))
                .transpose()
                .map_err(|e| BackendError::SerializationError(e.to_string()))?;
            Ok(JobStatus {
                state: JobState::parse(&state),
                progress: progress.clamp(0, 100) as u8,
                attempts: attempts.max(0) as u32,
                result,
                error,
            })
        })
        .transpose()
    }

    async fn next_visible(&self, job_type: JobType) -> Result<Option<Duration>, BackendError> {
        let earliest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(available_at) FROM lf_jobs WHERE state = 'waiting' AND job_type = ?",
        )
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(earliest.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn recover_orphans(&self) -> Result<usize, BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE lf_jobs
            SET state = 'waiting', started_at = NULL
            WHERE state = 'active'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() as usize)
    }
}
