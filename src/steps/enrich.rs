use async_trait::async_trait;
use serde::Deserialize;

use crate::step::{Dataset, Step, StepContext, StepError, StepExecutor};

/// Config of an `enrich` step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrichConfig {
    pub provider: Option<String>,
}

/// Pass-through until an enrichment provider contract exists.
pub struct EnrichStep;

#[async_trait]
impl StepExecutor for EnrichStep {
    async fn execute(
        &self,
        dataset: Dataset,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        let config: EnrichConfig = step.decode_config()?;
        tracing::info!(
            run_id = %ctx.run_id,
            items = dataset.len(),
            provider = config.provider.as_deref().unwrap_or("unknown"),
            "Enrichment has no provider yet, passing dataset through"
        );
        Ok(dataset)
    }
}
