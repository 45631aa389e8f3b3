//! Integration tests for execution requests and the job handlers.

use async_trait::async_trait;
use leadflow::dispatch::{ScrapeJobHandler, WorkflowJobHandler};
use leadflow::queue::MemoryBackend;
use leadflow::steps::{FilterStep, PersistStep};
use leadflow::{
    Dataset, DispatchError, Dispatcher, Engine, Executors, JobState, JobType, MemoryStore,
    OwnerId, PollOptions, ProviderError, Queue, QueueBuilder, Record, RetryPolicy, RunStatus,
    Step, StepContext, StepError, StepExecutor, StepKind, Store, TaskProvider, Workflow,
    WorkflowId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Leads;

#[async_trait]
impl StepExecutor for Leads {
    async fn execute(
        &self,
        _dataset: Dataset,
        _step: &Step,
        _ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        Ok(vec![
            json!({ "firstName": "Ada", "age": 36, "email": "ada@example.com" }),
            json!({ "firstName": "Bob", "age": 22 }),
            json!({ "firstName": "Cy", "age": 41 }),
        ])
    }
}

fn lead_workflow(owner: OwnerId) -> Workflow {
    Workflow::new(
        owner,
        "adults",
        vec![
            Step::new(StepKind::Scrape),
            Step::new(StepKind::Filter)
                .with("field", json!("age"))
                .with("operator", json!("gt"))
                .with("value", json!("30")),
            Step::new(StepKind::Persist).with("tags", json!("lead, adult")),
        ],
    )
}

fn engine(store: Arc<MemoryStore>) -> Arc<Engine> {
    let executors = Executors::new()
        .with(StepKind::Scrape, Leads)
        .with(StepKind::Filter, FilterStep)
        .with(StepKind::Persist, PersistStep::new(store.clone()));
    Arc::new(Engine::new(store, executors))
}

async fn wait_for_run(store: &MemoryStore, run: leadflow::RunId) -> leadflow::WorkflowRun {
    for _ in 0..2000 {
        let current = store.get_run(run).await.unwrap().unwrap();
        if current.status.is_terminal() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {run} never finished");
}

#[tokio::test(start_paused = true)]
async fn test_execute_workflow_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();

    let queue = Arc::new(
        QueueBuilder::new(MemoryBackend::new())
            .handler(
                JobType::Workflow,
                WorkflowJobHandler::new(engine(store.clone())),
                2,
            )
            .build(),
    );
    let handle = queue.start().await;
    let dispatcher = Dispatcher::new(store.clone(), Some(queue.clone()));

    let execution = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();
    assert!(execution.queued);
    assert!(execution.message.is_none());
    let job_id = execution.job_id.unwrap();

    let run = wait_for_run(&store, execution.run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress, 100);
    assert_eq!(run.result.unwrap().items_found, 2);

    let contacts = store.contacts_for_owner(owner).await.unwrap();
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].first_name.as_deref(), Some("Ada"));
    assert_eq!(contacts[0].email.as_deref(), Some("ada@example.com"));
    assert_eq!(contacts[0].tags, vec!["lead", "adult"]);
    assert_eq!(contacts[0].source, "workflow");

    let mut job = dispatcher.job_status(job_id).await;
    for _ in 0..100 {
        if job.state == JobState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        job = dispatcher.job_status(job_id).await;
    }
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);

    let workflow = store.get_workflow(workflow.id, owner).await.unwrap().unwrap();
    assert!(workflow.last_run_at.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_each_execution_creates_a_run() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();

    let queue = Arc::new(QueueBuilder::new(MemoryBackend::new()).build());
    let dispatcher = Dispatcher::new(store.clone(), Some(queue));

    let first = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();
    let second = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.job_id, second.job_id);
    assert_eq!(store.runs_for_workflow(workflow.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_without_queue_run_stays_pending() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();

    let dispatcher = Dispatcher::new(store.clone(), None);
    let execution = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();

    assert!(!execution.queued);
    assert!(execution.job_id.is_none());
    assert!(execution.message.unwrap().contains("BROKER_URL"));

    let run = dispatcher
        .run_status(execution.run_id, owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.progress, 0);
}

#[tokio::test]
async fn test_unknown_or_foreign_workflow() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();
    let dispatcher = Dispatcher::new(store.clone(), None);

    let missing = WorkflowId::new();
    let err = dispatcher.execute_workflow(missing, owner).await.unwrap_err();
    assert!(matches!(err, DispatchError::WorkflowNotFound(id) if id == missing));

    let err = dispatcher
        .execute_workflow(workflow.id, OwnerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::WorkflowNotFound(_)));
    assert!(store.runs_for_workflow(workflow.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_status_is_owner_scoped() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();
    let dispatcher = Dispatcher::new(store.clone(), None);

    let execution = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();
    let foreign = dispatcher
        .run_status(execution.run_id, OwnerId::new())
        .await
        .unwrap();
    assert!(foreign.is_none());
}

#[tokio::test]
async fn test_start_scrape_without_queue() {
    let dispatcher = Dispatcher::new(Arc::new(MemoryStore::new()), None);

    let err = dispatcher
        .start_scrape("apify/web-scraper", json!({}), OwnerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::QueueUnavailable));
    assert_eq!(
        dispatcher.job_status(leadflow::JobId(1)).await.state,
        JobState::Unknown
    );
}

struct SlowProvider;

#[async_trait]
impl TaskProvider for SlowProvider {
    async fn start(&self, task_def_id: &str, _input: &Value) -> Result<String, ProviderError> {
        Ok(format!("{task_def_id}-run"))
    }

    async fn fetch_result(&self, _remote_run_id: &str) -> Result<Option<Vec<Record>>, ProviderError> {
        Ok(Some(vec![json!({ "name": "Acme" }), json!({ "name": "Globex" })]))
    }
}

async fn wait_job(queue: &Queue, id: leadflow::JobId) -> leadflow::JobStatus {
    for _ in 0..2000 {
        let status = queue.status(id).await;
        if matches!(status.state, JobState::Completed | JobState::Failed) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} never finished");
}

#[tokio::test(start_paused = true)]
async fn test_standalone_scrape_job() {
    let poll = PollOptions {
        max_attempts: 3,
        interval: Duration::from_secs(1),
    };
    let queue = Arc::new(
        QueueBuilder::new(MemoryBackend::new())
            .handler(
                JobType::Scrape,
                ScrapeJobHandler::new(Arc::new(SlowProvider), poll),
                3,
            )
            .build(),
    );
    let handle = queue.start().await;
    let dispatcher = Dispatcher::new(Arc::new(MemoryStore::new()), Some(queue.clone()));

    let id = dispatcher
        .start_scrape("apify/web-scraper", Value::Null, OwnerId::new())
        .await
        .unwrap();
    let status = wait_job(&queue, id).await;

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    let result = status.result.unwrap();
    assert_eq!(result["remote_run_id"], "apify/web-scraper-run");
    assert_eq!(result["items_found"], 2);
    assert_eq!(result["results"][1]["name"], "Globex");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scrape_without_credentials_is_not_retried() {
    let queue = Arc::new(
        QueueBuilder::new(MemoryBackend::new())
            .handler(
                JobType::Scrape,
                ScrapeJobHandler::new(
                    Arc::new(leadflow::ApifyClient::new(None)),
                    PollOptions::default(),
                ),
                1,
            )
            .retry_policy(RetryPolicy::exponential(3))
            .build(),
    );
    let handle = queue.start().await;

    let id = queue
        .enqueue(
            JobType::Scrape,
            json!({ "source_id": "apify/web-scraper", "owner": OwnerId::new() }),
        )
        .await
        .unwrap();
    let status = wait_job(&queue, id).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 1);
    assert!(status.error.unwrap().contains("APIFY_API_TOKEN"));

    handle.shutdown().await;
}

struct Explodes;

#[async_trait]
impl StepExecutor for Explodes {
    async fn execute(
        &self,
        _dataset: Dataset,
        _step: &Step,
        _ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        panic!("executor bug");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_step_fails_run_after_last_attempt() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = Workflow::new(owner, "boom", vec![Step::new(StepKind::Scrape)]);
    store.save_workflow(&workflow).await.unwrap();

    let engine = Arc::new(Engine::new(
        store.clone(),
        Executors::new().with(StepKind::Scrape, Explodes),
    ));
    let queue = Arc::new(
        QueueBuilder::new(MemoryBackend::new())
            .handler(JobType::Workflow, WorkflowJobHandler::new(engine), 1)
            .retry_policy(RetryPolicy::exponential(3))
            .build(),
    );
    let handle = queue.start().await;
    let dispatcher = Dispatcher::new(store.clone(), Some(queue.clone()));

    let execution = dispatcher.execute_workflow(workflow.id, owner).await.unwrap();
    let job = wait_job(&queue, execution.job_id.unwrap()).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.as_deref(), Some("workflow run panicked"));

    let run = store.get_run(execution.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("workflow run panicked"));
    assert!(run.completed_at.is_some());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_payload_fails_its_run() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let workflow = lead_workflow(owner);
    store.save_workflow(&workflow).await.unwrap();
    let run = store.create_run(workflow.id, owner).await.unwrap();

    let queue = Arc::new(
        QueueBuilder::new(MemoryBackend::new())
            .handler(
                JobType::Workflow,
                WorkflowJobHandler::new(engine(store.clone())),
                1,
            )
            .retry_policy(RetryPolicy::exponential(3))
            .build(),
    );
    let handle = queue.start().await;

    // Missing workflow_id, owner and steps.
    let id = queue
        .enqueue(JobType::Workflow, json!({ "run_id": run.id }))
        .await
        .unwrap();
    let job = wait_job(&queue, id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);

    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("payload"));

    handle.shutdown().await;
}
