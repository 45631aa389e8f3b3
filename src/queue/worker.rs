//! Worker pools that pull jobs from a backend and run their handlers.

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{BackendError, ClaimedJob, JobBackend, JobId, JobStatus, JobType, NewJob};
use crate::poller::ProgressSink;
use crate::retry::RetryPolicy;

/// Error returned by a job handler.
#[derive(Error, Debug)]
pub enum JobError {
    /// Transient failure - worth retrying.
    #[error("{0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("{0}")]
    Permanent(#[source] anyhow::Error),
}

impl JobError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Error returned by queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backend could not be reached. Callers should carry on without
    /// asynchronous execution.
    #[error("queue unavailable: {0}")]
    Unavailable(#[from] BackendError),
}

/// One attempt of a claimed job, as seen by its handler.
pub struct JobContext {
    job: ClaimedJob,
    backend: Arc<dyn JobBackend>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> JobType {
        self.job.job_type
    }

    /// 1-indexed attempt number.
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.job.retry.max_attempts()
    }

    /// True when a failure of this attempt will not be retried.
    pub fn is_final_attempt(&self) -> bool {
        self.job.attempt >= self.max_attempts()
    }

    /// Decode the payload. A payload that does not decode never will.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            JobError::permanent(anyhow::anyhow!("invalid {} payload: {e}", self.job.job_type))
        })
    }
}

#[async_trait]
impl ProgressSink for JobContext {
    async fn report(&self, progress: u8) {
        if let Err(e) = self.backend.set_progress(self.job.id, progress).await {
            warn!(job_id = %self.job.id, error = %e, "Failed to record job progress");
        }
    }
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt, returning the job's result value.
    async fn handle(&self, job: &JobContext) -> Result<serde_json::Value, JobError>;
}

struct Pool {
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

/// A job queue with a bounded worker pool per job type.
pub struct Queue {
    backend: Arc<dyn JobBackend>,
    pools: HashMap<JobType, Pool>,
    retry: RetryPolicy,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl Queue {
    /// Enqueue a job with the queue's retry policy.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, QueueError> {
        let id = self
            .backend
            .enqueue(NewJob {
                job_type,
                payload,
                retry: self.retry,
            })
            .await?;

        debug!(job_id = %id, job_type = %job_type, "Job enqueued");
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Look up a job. Never fails: unreachable backends and unknown ids
    /// report [`JobState::Unknown`](super::JobState::Unknown).
    pub async fn status(&self, id: JobId) -> JobStatus {
        match self.backend.get(id).await {
            Ok(Some(status)) => status,
            Ok(None) => JobStatus::unknown(),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job status unavailable");
                JobStatus::unknown()
            }
        }
    }

    /// Recover orphaned jobs and spawn the worker pools.
    pub async fn start(&self) -> QueueHandle {
        match self.backend.recover_orphans().await {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "Recovered orphaned jobs"),
            Err(e) => warn!(error = %e, "Failed to recover orphaned jobs"),
        }

        let token = CancellationToken::new();
        let mut workers = Vec::new();

        for (job_type, pool) in &self.pools {
            for worker_index in 0..pool.concurrency {
                let worker = Worker {
                    job_type: *job_type,
                    index: worker_index,
                    backend: self.backend.clone(),
                    handler: pool.handler.clone(),
                    poll_interval: self.poll_interval,
                    notify: self.notify.clone(),
                };
                workers.push(tokio::spawn(worker.run(token.clone())));
            }
            info!(job_type = %job_type, workers = pool.concurrency, "Worker pool started");
        }

        QueueHandle { token, workers }
    }
}

/// Running worker pools. Dropping the handle leaves workers running.
pub struct QueueHandle {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl QueueHandle {
    /// Stop taking jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Queue stopped");
    }
}

struct Worker {
    job_type: JobType,
    index: usize,
    backend: Arc<dyn JobBackend>,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl Worker {
    async fn run(self, token: CancellationToken) {
        debug!(job_type = %self.job_type, worker = self.index, "Worker started");

        while !token.is_cancelled() {
            let wait = match self.backend.claim(self.job_type).await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => self.idle_wait().await,
                Err(e) => {
                    warn!(job_type = %self.job_type, error = %e, "Failed to claim job");
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!(job_type = %self.job_type, worker = self.index, "Worker stopped");
    }

    /// Sleep until the next delayed job becomes visible, at most `poll_interval`.
    async fn idle_wait(&self) -> Duration {
        match self.backend.next_visible(self.job_type).await {
            Ok(Some(wait)) => wait.min(self.poll_interval),
            Ok(None) => self.poll_interval,
            Err(e) => {
                debug!(job_type = %self.job_type, error = %e, "Failed to read next visible job");
                self.poll_interval
            }
        }
    }

    async fn process(&self, job: ClaimedJob) {
        let id = job.id;
        let attempt = job.attempt;
        let retry = job.retry;
        info!(job_id = %id, job_type = %self.job_type, attempt, "Processing job");

        let ctx = JobContext {
            job,
            backend: self.backend.clone(),
        };

        let outcome = AssertUnwindSafe(self.handler.handle(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::retryable(anyhow::anyhow!("job handler panicked"))));

        let recorded = match outcome {
            Ok(result) => {
                info!(job_id = %id, attempt, "Job completed");
                self.backend.complete(id, result).await
            }
            Err(e) => {
                let message = e.to_string();
                let delay = if e.is_retryable() {
                    retry.delay_after_attempt(attempt)
                } else {
                    None
                };

                match delay {
                    Some(delay) => {
                        warn!(
                            job_id = %id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Job attempt failed, retrying"
                        );
                        self.backend.retry_later(id, &message, delay).await
                    }
                    None => {
                        error!(job_id = %id, attempt, error = %message, "Job failed");
                        self.backend.fail(id, &message).await
                    }
                }
            }
        };

        if let Err(e) = recorded {
            error!(job_id = %id, error = %e, "Failed to record job outcome");
        }
    }
}

/// Builder for constructing a Queue.
pub struct QueueBuilder {
    backend: Arc<dyn JobBackend>,
    pools: HashMap<JobType, Pool>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl QueueBuilder {
    /// Create a new builder with the given backend.
    pub fn new(backend: impl JobBackend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Create a new builder over a shared backend.
    pub fn from_arc(backend: Arc<dyn JobBackend>) -> Self {
        Self {
            backend,
            pools: HashMap::new(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Register the handler for a job type with its worker count.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` is 0.
    pub fn handler(
        mut self,
        job_type: JobType,
        handler: impl JobHandler + 'static,
        concurrency: usize,
    ) -> Self {
        assert!(concurrency > 0, "worker concurrency must be at least 1");
        self.pools.insert(
            job_type,
            Pool {
                handler: Arc::new(handler),
                concurrency,
            },
        );
        self
    }

    /// Set the retry policy applied to newly enqueued jobs.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the longest an idle worker sleeps before looking for jobs again.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the queue.
    pub fn build(self) -> Queue {
        Queue {
            backend: self.backend,
            pools: self.pools,
            retry: self.retry,
            poll_interval: self.poll_interval,
            notify: Arc::new(Notify::new()),
        }
    }
}
