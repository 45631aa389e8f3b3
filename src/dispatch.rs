//! Request entrypoints and the job handlers behind them.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::client::{ProviderError, TaskProvider};
use crate::engine::{AttemptInfo, Engine, WorkflowJob};
use crate::model::{OwnerId, RunId, WorkflowId, WorkflowRun};
use crate::poller::{poll, PollOptions, ProgressSink};
use crate::queue::{JobContext, JobError, JobHandler, JobId, JobStatus, JobType, Queue};
use crate::store::{Store, StoreError};

const RUN_PANICKED: &str = "workflow run panicked";

const QUEUE_UNAVAILABLE: &str =
    "Run created but the job queue is unavailable. Configure BROKER_URL to enable background processing.";

/// Payload of a standalone scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub source_id: String,
    #[serde(default)]
    pub input: Value,
    pub owner: OwnerId,
}

/// Outcome of an execution request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub run_id: RunId,
    pub queued: bool,
    pub job_id: Option<JobId>,
    pub message: Option<String>,
}

/// Error returned by the entrypoints.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("job queue unavailable; configure BROKER_URL to enable job queuing")]
    QueueUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Accepts execution requests and hands them to the queue.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Option<Arc<Queue>>,
}

impl Dispatcher {
    /// Without a queue every run is created but never dispatched.
    pub fn new(store: Arc<dyn Store>, queue: Option<Arc<Queue>>) -> Self {
        Self { store, queue }
    }

    /// Create a run for the owner's workflow and enqueue it.
    ///
    /// Every call creates a new run. An unreachable queue is not an error:
    /// the run stays `pending` and `queued` is false.
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        owner: OwnerId,
    ) -> Result<Execution, DispatchError> {
        let workflow = self
            .store
            .get_workflow(workflow_id, owner)
            .await?
            .ok_or(DispatchError::WorkflowNotFound(workflow_id))?;

        let run = self.store.create_run(workflow.id, owner).await?;

        let job = WorkflowJob {
            workflow_id: workflow.id,
            run_id: run.id,
            owner,
            steps: workflow.steps,
        };

        let Some(queue) = &self.queue else {
            warn!(run_id = %run.id, "No job queue configured, run will not be dispatched");
            return Ok(unqueued(run.id));
        };

        let payload = match serde_json::to_value(&job) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to encode workflow job");
                return Ok(unqueued(run.id));
            }
        };

        match queue.enqueue(JobType::Workflow, payload).await {
            Ok(job_id) => {
                info!(workflow_id = %workflow_id, run_id = %run.id, job_id = %job_id, "Workflow queued");
                Ok(Execution {
                    run_id: run.id,
                    queued: true,
                    job_id: Some(job_id),
                    message: None,
                })
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to enqueue workflow job");
                Ok(unqueued(run.id))
            }
        }
    }

    /// Queue a standalone scrape of `source_id`.
    pub async fn start_scrape(
        &self,
        source_id: &str,
        input: Value,
        owner: OwnerId,
    ) -> Result<JobId, DispatchError> {
        let queue = self.queue.as_ref().ok_or(DispatchError::QueueUnavailable)?;
        let job = ScrapeJob {
            source_id: source_id.to_string(),
            input,
            owner,
        };
        let payload = serde_json::to_value(&job).map_err(|_| DispatchError::QueueUnavailable)?;

        queue
            .enqueue(JobType::Scrape, payload)
            .await
            .map_err(|e| {
                warn!(source_id, error = %e, "Failed to enqueue scrape job");
                DispatchError::QueueUnavailable
            })
    }

    /// Job status for pollers. Unknown when no queue is reachable.
    pub async fn job_status(&self, id: JobId) -> JobStatus {
        match &self.queue {
            Some(queue) => queue.status(id).await,
            None => JobStatus::unknown(),
        }
    }

    /// The owner's view of a run record.
    pub async fn run_status(
        &self,
        run_id: RunId,
        owner: OwnerId,
    ) -> Result<Option<WorkflowRun>, DispatchError> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .filter(|run| run.owner == owner))
    }
}

fn unqueued(run_id: RunId) -> Execution {
    Execution {
        run_id,
        queued: false,
        job_id: None,
        message: Some(QUEUE_UNAVAILABLE.to_string()),
    }
}

/// Runs workflow jobs through the engine.
pub struct WorkflowJobHandler {
    engine: Arc<Engine>,
}

impl WorkflowJobHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Just enough of a workflow payload to find its run.
#[derive(Deserialize)]
struct RunRef {
    run_id: RunId,
}

#[async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, job: &JobContext) -> Result<Value, JobError> {
        let attempt = AttemptInfo {
            attempt: job.attempt(),
            max_attempts: job.max_attempts(),
        };

        let payload: WorkflowJob = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                if let Ok(RunRef { run_id }) = job.payload::<RunRef>() {
                    self.engine
                        .abandon(run_id, attempt, false, &e.to_string())
                        .await;
                }
                return Err(e);
            }
        };

        let outcome = AssertUnwindSafe(self.engine.run(&payload, attempt, job))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => serde_json::to_value(result).map_err(JobError::permanent),
            Ok(Err(e)) if e.is_retryable() => Err(JobError::retryable(e)),
            Ok(Err(e)) => Err(JobError::permanent(e)),
            Err(_) => {
                error!(job_id = %job.id(), run_id = %payload.run_id, "Workflow run panicked");
                self.engine
                    .abandon(payload.run_id, attempt, true, RUN_PANICKED)
                    .await;
                Err(JobError::retryable(anyhow!(RUN_PANICKED)))
            }
        }
    }
}

/// Runs standalone scrape jobs: start the remote task, wait, return records.
pub struct ScrapeJobHandler {
    provider: Arc<dyn TaskProvider>,
    poll: PollOptions,
}

impl ScrapeJobHandler {
    pub fn new(provider: Arc<dyn TaskProvider>, poll: PollOptions) -> Self {
        Self { provider, poll }
    }
}

#[async_trait]
impl JobHandler for ScrapeJobHandler {
    async fn handle(&self, job: &JobContext) -> Result<Value, JobError> {
        let payload: ScrapeJob = job.payload()?;
        let input = match payload.input {
            Value::Null => json!({}),
            other => other,
        };

        info!(job_id = %job.id(), source_id = %payload.source_id, "Starting scrape job");
        job.report(5).await;

        let remote_run_id = self
            .provider
            .start(&payload.source_id, &input)
            .await
            .map_err(|e| match e {
                ProviderError::MissingCredential => JobError::permanent(e),
                other => JobError::retryable(other),
            })?;
        job.report(10).await;

        let results = poll(self.provider.as_ref(), &remote_run_id, self.poll, job)
            .await
            .map_err(JobError::retryable)?;
        job.report(100).await;

        info!(job_id = %job.id(), items = results.len(), "Scrape job finished");
        Ok(json!({
            "source_id": payload.source_id,
            "remote_run_id": remote_run_id,
            "items_found": results.len(),
            "results": results,
        }))
    }
}
