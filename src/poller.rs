//! Polling for externally started asynchronous tasks.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::client::TaskProvider;
use crate::step::Record;

/// Receives fractional progress (0-100).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8);
}

/// A sink that discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: u8) {}
}

/// How long to wait for a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollOptions {
    /// 60 polls, 5 seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(5),
        }
    }
}

/// Error returned when polling gives up.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PollError {
    #[error("remote task {task_id} timed out after {attempts} polls")]
    Timeout { task_id: String, attempts: u32 },
}

/// Progress reported while waiting on `attempt` (0-based).
///
/// Stays within 10..=90; dispatch and post-processing own the rest.
pub fn poll_progress(attempt: u32, max_attempts: u32) -> u8 {
    if max_attempts == 0 {
        return 10;
    }
    let attempt = attempt as u64;
    let max = max_attempts as u64;
    // round(80 * attempt / max), halves rounding up
    let scaled = (160 * attempt + max) / (2 * max);
    (10 + scaled).min(90) as u8
}

/// Poll `task_id` until it yields a non-empty result.
///
/// Sleeps `interval` before each fetch. Fetch errors count as "not ready";
/// only running out of attempts is fatal.
pub async fn poll(
    provider: &dyn TaskProvider,
    task_id: &str,
    options: PollOptions,
    progress: &dyn ProgressSink,
) -> Result<Vec<Record>, PollError> {
    for attempt in 0..options.max_attempts {
        tokio::time::sleep(options.interval).await;
        progress
            .report(poll_progress(attempt, options.max_attempts))
            .await;

        match provider.fetch_result(task_id).await {
            Ok(Some(records)) if !records.is_empty() => {
                tracing::debug!(task_id, attempt, count = records.len(), "Remote task finished");
                return Ok(records);
            }
            Ok(_) => {
                tracing::debug!(task_id, attempt, "Remote task not ready");
            }
            Err(e) => {
                tracing::debug!(task_id, attempt, error = %e, "Fetch failed, still waiting");
            }
        }
    }

    Err(PollError::Timeout {
        task_id: task_id.to_string(),
        attempts: options.max_attempts,
    })
}
