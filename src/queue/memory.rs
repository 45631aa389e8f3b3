//! In-process job backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::store::{BackendError, ClaimedJob, JobBackend, JobId, JobState, JobStatus, JobType, NewJob};
use crate::retry::RetryPolicy;

struct JobRecord {
    job_type: JobType,
    payload: serde_json::Value,
    retry: RetryPolicy,
    state: JobState,
    progress: u8,
    attempts: u32,
    result: Option<serde_json::Value>,
    error: Option<String>,
    available_at: Instant,
}

#[derive(Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// Job backend kept in process memory.
///
/// Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::StorageError("memory backend poisoned".into()))
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, BackendError> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&id).ok_or(BackendError::NotFound(id))?;
        Ok(f(job))
    }
}

#[async_trait]
impl JobBackend for MemoryBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, BackendError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = JobId(state.next_id);
        state.jobs.insert(
            id,
            JobRecord {
                job_type: job.job_type,
                payload: job.payload,
                retry: job.retry,
                state: JobState::Waiting,
                progress: 0,
                attempts: 0,
                result: None,
                error: None,
                available_at: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn claim(&self, job_type: JobType) -> Result<Option<ClaimedJob>, BackendError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let claimed = state.jobs.iter_mut().find(|(_, job)| {
            job.job_type == job_type && job.state == JobState::Waiting && job.available_at <= now
        });

        Ok(claimed.map(|(id, job)| {
            job.state = JobState::Active;
            job.attempts += 1;
            ClaimedJob {
                id: *id,
                job_type: job.job_type,
                payload: job.payload.clone(),
                attempt: job.attempts,
                retry: job.retry,
            }
        }))
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError> {
        self.with_job(id, |job| job.progress = progress.min(100))
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.state = JobState::Completed;
            job.result = Some(result);
            job.error = None;
        })
    }

    async fn retry_later(
        &self,
        id: JobId,
        error: &str,
        delay: Duration,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.state = JobState::Waiting;
            job.error = Some(error.to_string());
            job.available_at = Instant::now() + delay;
        })
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.state = JobState::Failed;
            job.error = Some(error.to_string());
        })
    }

    async fn get(&self, id: JobId) -> Result<Option<JobStatus>, BackendError> {
        Ok(self.lock()?.jobs.get(&id).map(|job| JobStatus {
            state: job.state,
            progress: job.progress,
            attempts: job.attempts,
            result: job.result.clone(),
            error: job.error.clone(),
        }))
    }

    async fn next_visible(&self, job_type: JobType) -> Result<Option<Duration>, BackendError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|job| job.job_type == job_type && job.state == JobState::Waiting)
            .map(|job| job.available_at.saturating_duration_since(now))
            .min())
    }

    async fn recover_orphans(&self) -> Result<usize, BackendError> {
        let mut state = self.lock()?;
        let mut recovered = 0;
        for job in state.jobs.values_mut() {
            if job.state == JobState::Active {
                job.state = JobState::Waiting;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
