//! Integration tests for remote task polling.

use async_trait::async_trait;
use leadflow::{poll, NoProgress, PollError, PollOptions, ProgressSink, ProviderError, Record, TaskProvider};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Becomes ready on the `ready_on`th fetch (1-based). Never ready when 0.
struct Scripted {
    ready_on: u32,
    fail_first: u32,
    fetches: AtomicU32,
}

impl Scripted {
    fn new(ready_on: u32) -> Self {
        Self {
            ready_on,
            fail_first: 0,
            fetches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskProvider for Scripted {
    async fn start(&self, _task_def_id: &str, _input: &Value) -> Result<String, ProviderError> {
        Ok("remote-1".into())
    }

    async fn fetch_result(&self, _remote_run_id: &str) -> Result<Option<Vec<Record>>, ProviderError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(ProviderError::Api {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        if self.ready_on != 0 && n >= self.ready_on {
            Ok(Some(vec![json!({ "name": "Acme" })]))
        } else {
            Ok(Some(Vec::new()))
        }
    }
}

#[derive(Default)]
struct Recorded(Mutex<Vec<u8>>);

#[async_trait]
impl ProgressSink for Recorded {
    async fn report(&self, progress: u8) {
        self.0.lock().unwrap().push(progress);
    }
}

fn options(max_attempts: u32) -> PollOptions {
    PollOptions {
        max_attempts,
        interval: Duration::from_secs(5),
    }
}

#[tokio::test(start_paused = true)]
async fn test_ready_on_last_attempt() {
    let provider = Scripted::new(3);
    let sink = Recorded::default();

    let records = poll(&provider, "remote-1", options(3), &sink).await.unwrap();

    assert_eq!(records, vec![json!({ "name": "Acme" })]);
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(*sink.0.lock().unwrap(), vec![10, 37, 63]);
}

#[tokio::test(start_paused = true)]
async fn test_times_out_after_exactly_max_polls() {
    let provider = Scripted::new(0);
    let started = tokio::time::Instant::now();

    let err = poll(&provider, "remote-1", options(4), &NoProgress)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PollError::Timeout {
            task_id: "remote-1".into(),
            attempts: 4
        }
    );
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_errors_keep_polling() {
    let provider = Scripted {
        ready_on: 3,
        fail_first: 2,
        fetches: AtomicU32::new(0),
    };

    let records = poll(&provider, "remote-1", options(5), &NoProgress)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_waits_interval_before_first_fetch() {
    let provider = Scripted::new(1);
    let started = tokio::time::Instant::now();

    poll(&provider, "remote-1", options(2), &NoProgress)
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
}
