//! Integration tests for the built-in step executors.

use async_trait::async_trait;
use leadflow::steps::{AiTransformStep, EnrichStep, PersistStep, ScrapeStep};
use leadflow::{
    GenerateError, MemoryStore, OwnerId, PollOptions, ProviderError, Record, RunId, Step,
    StepContext, StepError, StepExecutor, StepKind, Store, TaskProvider, TextGenerator,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ctx(owner: OwnerId) -> StepContext {
    StepContext {
        run_id: RunId::new(),
        owner,
        index: 0,
    }
}

/// Ready after two empty polls; remembers what it was started with.
#[derive(Default)]
struct FakeProvider {
    started: Mutex<Vec<(String, Value)>>,
    polls: Mutex<u32>,
}

#[async_trait]
impl TaskProvider for FakeProvider {
    async fn start(&self, task_def_id: &str, input: &Value) -> Result<String, ProviderError> {
        self.started
            .lock()
            .unwrap()
            .push((task_def_id.to_string(), input.clone()));
        Ok("remote-7".into())
    }

    async fn fetch_result(&self, _remote_run_id: &str) -> Result<Option<Vec<Record>>, ProviderError> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        if *polls < 3 {
            return Ok(None);
        }
        Ok(Some(vec![json!({ "title": "Acme Dental" })]))
    }
}

fn fast_poll(max_attempts: u32) -> PollOptions {
    PollOptions {
        max_attempts,
        interval: Duration::from_secs(5),
    }
}

#[tokio::test(start_paused = true)]
async fn test_scrape_replaces_dataset_with_results() {
    let provider = Arc::new(FakeProvider::default());
    let step = Step::new(StepKind::Scrape)
        .with("actor_id", "apify/google-maps")
        .with("input_config", r#"{"query":"dentist"}"#);

    let out = ScrapeStep::new(provider.clone(), fast_poll(5))
        .execute(vec![json!({ "stale": true })], &step, &ctx(OwnerId::new()))
        .await
        .unwrap();

    assert_eq!(out, vec![json!({ "title": "Acme Dental" })]);
    let started = provider.started.lock().unwrap();
    assert_eq!(started[0].0, "apify/google-maps");
    assert_eq!(started[0].1, json!({ "query": "dentist" }));
}

#[tokio::test(start_paused = true)]
async fn test_scrape_timeout_is_retryable() {
    let provider = Arc::new(FakeProvider::default());
    let step = Step::new(StepKind::Scrape).with("source_id", "apify/google-maps");

    let err = ScrapeStep::new(provider, fast_poll(2))
        .execute(Vec::new(), &step, &ctx(OwnerId::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::ExternalTaskFailed(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_scrape_requires_source() {
    let step = Step::new(StepKind::Scrape);

    let err = ScrapeStep::new(Arc::new(FakeProvider::default()), fast_poll(1))
        .execute(Vec::new(), &step, &ctx(OwnerId::new()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StepError::MissingConfig {
            key: "source_id",
            ..
        }
    ));
    assert!(!err.is_retryable());
}

struct Canned(Result<String, ()>);

#[async_trait]
impl TextGenerator for Canned {
    async fn generate(&self, _prompt: &str, context: &str) -> Result<String, GenerateError> {
        assert!(context.starts_with("Data to transform:\n"));
        assert!(context.ends_with("Return the transformed data as a JSON array."));
        self.0.clone().map_err(|_| GenerateError::EmptyResponse)
    }
}

#[tokio::test]
async fn test_ai_transform_parses_reply() {
    let generator = Canned(Ok(
        "Sure! Here you go:\n[{\"name\": \"ADA\"}]\nLet me know if you need more.".into(),
    ));
    let step = Step::new(StepKind::AiTransform).with("prompt", "Upper-case the names");

    let out = AiTransformStep::new(Arc::new(generator))
        .execute(vec![json!({ "name": "ada" })], &step, &ctx(OwnerId::new()))
        .await
        .unwrap();

    assert_eq!(out, vec![json!({ "name": "ADA" })]);
}

#[tokio::test]
async fn test_ai_transform_failures() {
    let step = Step::new(StepKind::AiTransform).with("prompt", "Upper-case the names");

    let err = AiTransformStep::new(Arc::new(Canned(Ok("I can't do that.".into()))))
        .execute(Vec::new(), &step, &ctx(OwnerId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, StepError::TransformParseError(_)));

    let err = AiTransformStep::new(Arc::new(Canned(Err(()))))
        .execute(Vec::new(), &step, &ctx(OwnerId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, StepError::Generation(_)));

    let err = AiTransformStep::new(Arc::new(Canned(Ok("[]".into()))))
        .execute(Vec::new(), &Step::new(StepKind::AiTransform), &ctx(OwnerId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, StepError::MissingConfig { key: "prompt", .. }));
}

#[tokio::test]
async fn test_persist_maps_and_tags_contacts() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();
    let step = Step::new(StepKind::Persist).with("tags", "lead");
    let dataset = vec![json!({ "firstName": "A" })];

    let out = PersistStep::new(store.clone())
        .execute(dataset.clone(), &step, &ctx(owner))
        .await
        .unwrap();
    assert_eq!(out, dataset);

    let contacts = store.contacts_for_owner(owner).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].first_name.as_deref(), Some("A"));
    assert_eq!(contacts[0].tags, vec!["lead"]);
    assert_eq!(contacts[0].source, "workflow");
}

#[tokio::test]
async fn test_persist_empty_dataset_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerId::new();

    let out = PersistStep::new(store.clone())
        .execute(Vec::new(), &Step::new(StepKind::Persist), &ctx(owner))
        .await
        .unwrap();

    assert!(out.is_empty());
    assert!(store.contacts_for_owner(owner).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enrich_passes_through() {
    let dataset = vec![json!({ "email": "a@example.com" }), json!({ "email": null })];

    let out = EnrichStep
        .execute(
            dataset.clone(),
            &Step::new(StepKind::Enrich).with("provider", "clearbit"),
            &ctx(OwnerId::new()),
        )
        .await
        .unwrap();

    assert_eq!(out, dataset);
}
