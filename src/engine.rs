//! Workflow engine: runs one run's step list to completion or first failure.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{OwnerId, RunId, RunResult, RunStatus, RunUpdate, WorkflowId};
use crate::poller::ProgressSink;
use crate::step::{Dataset, Step, StepContext, StepError, StepKind};
use crate::steps::Executors;
use crate::store::{Store, StoreError};

/// Payload of a workflow job.
///
/// `steps` is the workflow's step list captured at dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub owner: OwnerId,
    pub steps: Vec<Step>,
}

/// Which job attempt is executing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptInfo {
    /// A lone attempt with no retry behind it.
    pub fn single() -> Self {
        Self {
            attempt: 1,
            max_attempts: 1,
        }
    }

    pub fn is_final(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Error returned by a run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("step {} ({kind}) failed: {source}", .index + 1)]
    Step {
        index: usize,
        kind: StepKind,
        #[source]
        source: StepError,
    },

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} already finished")]
    RunFinished(RunId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Returns true if re-running the whole job could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Step { source, .. } => source.is_retryable(),
            Self::Store(_) => true,
            Self::RunNotFound(_) | Self::RunFinished(_) => false,
        }
    }
}

/// `round(100 * completed / total)`, halves rounding up.
pub fn step_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((200 * completed.min(total) + total) / (2 * total)) as u8
}

/// Executes workflow runs.
pub struct Engine {
    store: Arc<dyn Store>,
    executors: Executors,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, executors: Executors) -> Self {
        Self { store, executors }
    }

    /// Execute the run described by `job`.
    ///
    /// Progress is persisted after every step and mirrored to `progress`.
    /// Any failure after the run is picked up, including a failed completion
    /// write, becomes the run's terminal `failed` record unless the queue
    /// will retry this attempt, in which case the run stays `running`.
    pub async fn run(
        &self,
        job: &WorkflowJob,
        attempt: AttemptInfo,
        progress: &dyn ProgressSink,
    ) -> Result<RunResult, EngineError> {
        let run = self
            .store
            .get_run(job.run_id)
            .await?
            .ok_or(EngineError::RunNotFound(job.run_id))?;
        if run.status.is_terminal() {
            return Err(EngineError::RunFinished(job.run_id));
        }

        info!(
            workflow_id = %job.workflow_id,
            run_id = %job.run_id,
            steps = job.steps.len(),
            attempt = attempt.attempt,
            "Starting workflow run"
        );

        let outcome = self.attempt(job, progress).await;
        if let Err(e) = &outcome {
            self.record_failure(job.run_id, attempt, e.is_retryable(), e.to_string())
                .await;
        }
        outcome
    }

    /// Record the failure of an attempt that ended outside [`Engine::run`],
    /// such as a panic or a payload that could not be decoded.
    ///
    /// A run that is already terminal is left alone.
    pub async fn abandon(&self, run_id: RunId, attempt: AttemptInfo, retryable: bool, reason: &str) {
        self.record_failure(run_id, attempt, retryable, reason.to_string())
            .await;
    }

    async fn attempt(
        &self,
        job: &WorkflowJob,
        progress: &dyn ProgressSink,
    ) -> Result<RunResult, EngineError> {
        self.store.update_run(job.run_id, RunUpdate::Start).await?;
        progress.report(0).await;

        let dataset = self.execute_steps(job, progress).await?;
        self.finish(job, dataset).await
    }

    async fn execute_steps(
        &self,
        job: &WorkflowJob,
        progress: &dyn ProgressSink,
    ) -> Result<Dataset, EngineError> {
        let total = job.steps.len();
        let mut dataset = Dataset::new();

        for (index, step) in job.steps.iter().enumerate() {
            let step_err = |source| EngineError::Step {
                index,
                kind: step.kind,
                source,
            };
            let executor = self
                .executors
                .get(step.kind)
                .ok_or_else(|| step_err(StepError::Unsupported))?;

            debug!(
                run_id = %job.run_id,
                "Executing step {}/{}: {}",
                index + 1,
                total,
                step.kind
            );

            let ctx = StepContext {
                run_id: job.run_id,
                owner: job.owner,
                index,
            };
            dataset = executor
                .execute(dataset, step, &ctx)
                .await
                .map_err(step_err)?;

            let checkpoint = step_progress(index + 1, total);
            self.store
                .update_run(job.run_id, RunUpdate::Progress(checkpoint))
                .await?;
            progress.report(checkpoint).await;
        }

        Ok(dataset)
    }

    async fn finish(&self, job: &WorkflowJob, dataset: Dataset) -> Result<RunResult, EngineError> {
        let result = RunResult {
            items_processed: dataset.len(),
            items_found: dataset.len(),
        };
        let now = Utc::now();

        self.store
            .update_run(job.run_id, RunUpdate::Complete { result, at: now })
            .await?;

        if let Err(e) = self.store.mark_workflow_ran(job.workflow_id, now).await {
            warn!(workflow_id = %job.workflow_id, error = %e, "Failed to update last_run_at");
        }

        info!(
            workflow_id = %job.workflow_id,
            run_id = %job.run_id,
            items = result.items_found,
            "Workflow run completed"
        );
        Ok(result)
    }

    async fn record_failure(
        &self,
        run_id: RunId,
        attempt: AttemptInfo,
        retryable: bool,
        message: String,
    ) {
        match self.store.get_run(run_id).await {
            Ok(Some(run)) if run.status.is_terminal() => {
                debug!(run_id = %run_id, status = %run.status, "Run already finished, failure not recorded");
                return;
            }
            // Only a running run can fail.
            Ok(Some(run)) if run.status == RunStatus::Pending => {
                if let Err(e) = self.store.update_run(run_id, RunUpdate::Start).await {
                    error!(run_id = %run_id, error = %e, "Failed to record run failure");
                    return;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(run_id = %run_id, "Run not found, failure not recorded");
                return;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to load run before recording failure");
            }
        }

        let update = if !attempt.is_final() && retryable {
            warn!(
                run_id = %run_id,
                attempt = attempt.attempt,
                error = %message,
                "Workflow attempt failed, job will retry"
            );
            RunUpdate::AttemptFailed { error: message }
        } else {
            error!(
                run_id = %run_id,
                attempt = attempt.attempt,
                error = %message,
                "Workflow run failed"
            );
            RunUpdate::Fail {
                error: message,
                at: Utc::now(),
            }
        };

        if let Err(e) = self.store.update_run(run_id, update).await {
            error!(run_id = %run_id, error = %e, "Failed to record run failure");
        }
    }
}
