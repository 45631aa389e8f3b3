use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::step::{Dataset, Record, Step, StepContext, StepError, StepExecutor, StepKind};

/// Comparison applied by a `filter` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Lt,
}

impl FilterOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "equals" => Some(Self::Equals),
            "not_equals" => Some(Self::NotEquals),
            "contains" => Some(Self::Contains),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            _ => None,
        }
    }
}

/// Config of a `filter` step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Value>,
}

/// Keeps the records whose field satisfies the predicate.
pub struct FilterStep;

/// Render a scalar the way it is compared as text.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value. Anything non-numeric is NaN.
fn as_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                f64::NAN
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

/// Whether `record` passes. Absent or null fields fail every operator.
pub(crate) fn matches(record: &Record, field: &str, op: FilterOperator, expected: &Value) -> bool {
    let actual = match record.get(field) {
        Some(Value::Null) | None => return false,
        Some(v) => v,
    };

    match op {
        FilterOperator::Equals => as_text(actual) == as_text(expected),
        FilterOperator::NotEquals => as_text(actual) != as_text(expected),
        FilterOperator::Contains => as_text(actual)
            .to_lowercase()
            .contains(&as_text(expected).to_lowercase()),
        // NaN compares false either way
        FilterOperator::Gt => as_number(actual) > as_number(expected),
        FilterOperator::Lt => as_number(actual) < as_number(expected),
    }
}

#[async_trait]
impl StepExecutor for FilterStep {
    async fn execute(
        &self,
        dataset: Dataset,
        step: &Step,
        _ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        let config: FilterConfig = step.decode_config()?;
        let missing = |key| StepError::MissingConfig {
            kind: StepKind::Filter,
            key,
        };

        let field = config.field.filter(|f| !f.is_empty()).ok_or(missing("field"))?;
        let operator = config.operator.ok_or(missing("operator"))?;
        let value = config.value.ok_or(missing("value"))?;
        let op = FilterOperator::parse(&operator).ok_or_else(|| StepError::InvalidConfig {
            kind: StepKind::Filter,
            reason: format!("unknown operator '{operator}'"),
        })?;

        let before = dataset.len();
        let kept: Dataset = dataset
            .into_iter()
            .filter(|record| matches(record, &field, op, &value))
            .collect();

        tracing::debug!(field = %field, operator = %operator, before, after = kept.len(), "Filtered dataset");
        Ok(kept)
    }
}
