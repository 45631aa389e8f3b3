use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::generate::{GenerateError, TextGenerator};
use crate::step::{Dataset, Step, StepContext, StepError, StepExecutor, StepKind};

/// Config of an `ai_transform` step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiTransformConfig {
    pub prompt: Option<String>,
}

/// Rewrites the dataset through the text generator.
pub struct AiTransformStep {
    generator: Arc<dyn TextGenerator>,
}

impl AiTransformStep {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

/// Pull the JSON array out of a free-form reply.
///
/// Tries the span from the first `[` to the last `]`, then the whole reply.
pub(crate) fn extract_array(reply: &str) -> Result<Dataset, StepError> {
    let span = match (reply.find('['), reply.rfind(']')) {
        (Some(start), Some(end)) if start < end => Some(&reply[start..=end]),
        _ => None,
    };

    let parsed = span
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .or_else(|| serde_json::from_str::<Value>(reply.trim()).ok());

    match parsed {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(StepError::TransformParseError(
            "response is JSON but not an array".into(),
        )),
        None => Err(StepError::TransformParseError(
            "no JSON array found in response".into(),
        )),
    }
}

impl From<GenerateError> for StepError {
    fn from(e: GenerateError) -> Self {
        match e {
            GenerateError::MissingCredential => StepError::MissingCredential("ANTHROPIC_API_KEY"),
            other => StepError::Generation(other.to_string()),
        }
    }
}

#[async_trait]
impl StepExecutor for AiTransformStep {
    async fn execute(
        &self,
        dataset: Dataset,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        let config: AiTransformConfig = step.decode_config()?;
        let prompt = config
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or(StepError::MissingConfig {
                kind: StepKind::AiTransform,
                key: "prompt",
            })?;

        let data = serde_json::to_string_pretty(&dataset)
            .map_err(|e| StepError::Generation(e.to_string()))?;
        let context = format!(
            "Data to transform:\n{data}\n\nReturn the transformed data as a JSON array."
        );

        let reply = self.generator.generate(&prompt, &context).await?;
        let transformed = extract_array(&reply)?;

        tracing::info!(
            run_id = %ctx.run_id,
            input = dataset.len(),
            output = transformed.len(),
            "AI transform applied"
        );
        Ok(transformed)
    }
}
