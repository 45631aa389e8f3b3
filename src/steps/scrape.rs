use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::client::{ProviderError, TaskProvider};
use crate::poller::{poll, NoProgress, PollOptions};
use crate::step::{Dataset, Step, StepContext, StepError, StepExecutor, StepKind};

/// Config of a `scrape` step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeConfig {
    #[serde(alias = "actor_id")]
    pub source_id: Option<String>,
    /// Provider input, as an object or a JSON-encoded string.
    #[serde(alias = "input_config")]
    pub input: Option<Value>,
}

impl ScrapeConfig {
    /// Resolve the provider input, defaulting to an empty object.
    pub fn input_object(&self) -> Result<Value, StepError> {
        match &self.input {
            None | Some(Value::Null) => Ok(Value::Object(Map::new())),
            Some(Value::String(raw)) if raw.trim().is_empty() => Ok(Value::Object(Map::new())),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(v @ Value::Object(_)) => Ok(v),
                _ => Err(StepError::InvalidConfig {
                    kind: StepKind::Scrape,
                    reason: "input is not a JSON object".into(),
                }),
            },
            Some(v @ Value::Object(_)) => Ok(v.clone()),
            Some(_) => Err(StepError::InvalidConfig {
                kind: StepKind::Scrape,
                reason: "input must be an object".into(),
            }),
        }
    }
}

impl From<ProviderError> for StepError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::MissingCredential => StepError::MissingCredential("APIFY_API_TOKEN"),
            other => StepError::ExternalTaskFailed(other.to_string()),
        }
    }
}

/// Starts a remote scraping task and replaces the dataset with its records.
pub struct ScrapeStep {
    provider: Arc<dyn TaskProvider>,
    poll: PollOptions,
}

impl ScrapeStep {
    pub fn new(provider: Arc<dyn TaskProvider>, poll: PollOptions) -> Self {
        Self { provider, poll }
    }
}

#[async_trait]
impl StepExecutor for ScrapeStep {
    async fn execute(
        &self,
        _dataset: Dataset,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        let config: ScrapeConfig = step.decode_config()?;
        let source_id = config
            .source_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(StepError::MissingConfig {
                kind: StepKind::Scrape,
                key: "source_id",
            })?;
        let input = config.input_object()?;

        let remote_run_id = self.provider.start(source_id, &input).await?;
        tracing::info!(
            run_id = %ctx.run_id,
            source_id,
            remote_run_id = %remote_run_id,
            "Waiting for scrape results"
        );

        poll(self.provider.as_ref(), &remote_run_id, self.poll, &NoProgress)
            .await
            .map_err(|e| StepError::ExternalTaskFailed(e.to_string()))
    }
}
