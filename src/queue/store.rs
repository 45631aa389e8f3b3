//! Job backend trait and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kinds of work the queue accepts. Each has its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scrape,
    Workflow,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scrape" => Some(Self::Scrape),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible job state.
///
/// A job waiting out a retry backoff reports `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "waiting" => Self::Waiting,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub retry: RetryPolicy,
}

/// A job handed to exactly one worker for one attempt.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// 1-indexed attempt number of this execution.
    pub attempt: u32,
    pub retry: RetryPolicy,
}

/// Snapshot of a job for status polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobStatus {
    /// Status reported when the backend cannot answer.
    pub fn unknown() -> Self {
        Self {
            state: JobState::Unknown,
            progress: 0,
            attempts: 0,
            result: None,
            error: None,
        }
    }
}

/// Error type for backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("job {0} not found")]
    NotFound(JobId),
}

/// Trait for job queue backends (the broker).
///
/// `claim` must hand each waiting job to at most one caller.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Store a new waiting job.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError>;

    /// Atomically claim the oldest visible waiting job of `job_type`,
    /// marking it active and counting the attempt.
    async fn claim(&self, job_type: JobType) -> Result<Option<ClaimedJob>, BackendError>;

    async fn set_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError>;

    /// Mark a job completed with its result.
    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<(), BackendError>;

    /// Put a failed attempt back to waiting, invisible for `delay`.
    async fn retry_later(&self, id: JobId, error: &str, delay: Duration)
        -> Result<(), BackendError>;

    /// Mark a job permanently failed.
    async fn fail(&self, id: JobId, error: &str) -> Result<(), BackendError>;

    async fn get(&self, id: JobId) -> Result<Option<JobStatus>, BackendError>;

    /// Time until the earliest waiting job of `job_type` becomes claimable.
    /// `None` when no job of that type is waiting.
    async fn next_visible(&self, _job_type: JobType) -> Result<Option<Duration>, BackendError> {
        Ok(None)
    }

    /// Reset jobs stuck in "active" back to "waiting".
    /// Call on startup to recover from crashes.
    /// Returns the number of jobs recovered.
    async fn recover_orphans(&self) -> Result<usize, BackendError> {
        Ok(0) // Default: no-op for backends that don't support recovery
    }
}
