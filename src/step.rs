//! Step definitions, executor trait and error types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::model::{OwnerId, RunId};

/// An opaque record flowing between steps.
pub type Record = Value;

/// The working dataset of a run.
pub type Dataset = Vec<Record>;

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[serde(alias = "apify_scraper")]
    Scrape,
    #[serde(alias = "enrichment")]
    Enrich,
    Filter,
    AiTransform,
    #[serde(alias = "save_contacts")]
    Persist,
    /// Any kind name this engine does not know. Fails at execution time.
    #[serde(other)]
    Unsupported,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Enrich => "enrich",
            Self::Filter => "filter",
            Self::AiTransform => "ai_transform",
            Self::Persist => "persist",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a workflow's step list.
///
/// The config is kept as a raw JSON object and only decoded into the
/// kind's typed config when the step executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(alias = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Step {
    /// Create a step with an empty config.
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            config: Map::new(),
        }
    }

    /// Add a config entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// Decode the config into the kind's typed config.
    pub fn decode_config<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|e| {
            StepError::InvalidConfig {
                kind: self.kind,
                reason: e.to_string(),
            }
        })
    }
}

/// Error returned by a step execution.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("missing `{key}` in {kind} step config")]
    MissingConfig { kind: StepKind, key: &'static str },

    #[error("invalid {kind} step config: {reason}")]
    InvalidConfig { kind: StepKind, reason: String },

    #[error("{0} is not configured")]
    MissingCredential(&'static str),

    #[error("external task failed: {0}")]
    ExternalTaskFailed(String),

    #[error("failed to parse AI transform response as a JSON array: {0}")]
    TransformParseError(String),

    #[error("failed to save contacts: {0}")]
    PersistError(String),

    #[error("text generation failed: {0}")]
    Generation(String),

    #[error("unsupported step kind")]
    Unsupported,
}

impl StepError {
    /// Returns true if running the whole job again could succeed.
    ///
    /// Misconfiguration fails every attempt the same way.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::MissingConfig { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingCredential(_)
                | Self::Unsupported
        )
    }
}

/// Where a step executes.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub run_id: RunId,
    pub owner: OwnerId,
    /// Zero-based position in the step list.
    pub index: usize,
}

/// Executes one step kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Transform the dataset. Side-effect-only steps return it unchanged.
    async fn execute(
        &self,
        dataset: Dataset,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<Dataset, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_accepts_legacy_names() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "apify_scraper", "config": {"actor_id": "a"}},
            {"type": "enrichment", "config": {}},
            {"kind": "filter"},
            {"kind": "ai_transform", "config": {"prompt": "p"}},
            {"type": "save_contacts", "config": {}},
            {"type": "teleport", "config": {}}
        ]))
        .unwrap();

        let kinds: Vec<_> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Scrape,
                StepKind::Enrich,
                StepKind::Filter,
                StepKind::AiTransform,
                StepKind::Persist,
                StepKind::Unsupported,
            ]
        );
    }

    #[test]
    fn test_decode_config_reports_kind() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Cfg {
            prompt: Option<String>,
        }

        let step = Step::new(StepKind::AiTransform).with("prompt", 42);
        let err = step.decode_config::<Cfg>().unwrap_err();
        assert!(matches!(
            err,
            StepError::InvalidConfig {
                kind: StepKind::AiTransform,
                ..
            }
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!StepError::MissingCredential("APIFY_API_TOKEN").is_retryable());
        assert!(!StepError::MissingConfig {
            kind: StepKind::Filter,
            key: "field"
        }
        .is_retryable());
        assert!(StepError::ExternalTaskFailed("timeout".into()).is_retryable());
        assert!(StepError::TransformParseError("no array".into()).is_retryable());
    }
}
