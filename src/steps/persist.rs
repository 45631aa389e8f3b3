use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::model::NewContact;
use crate::step::{Dataset, Record, Step, StepContext, StepError, StepExecutor};
use crate::store::Store;

const SOURCE: &str = "workflow";

/// Tags given as `"a, b"` or `["a", "b"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Tags {
    Csv(String),
    List(Vec<String>),
}

impl Tags {
    /// Trimmed, non-empty tags.
    pub fn normalized(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Tags::Csv(s) => s.split(',').collect(),
            Tags::List(items) => items.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Config of a `persist` step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistConfig {
    pub tags: Option<Tags>,
}

/// First non-null alias, as text.
fn pick(record: &Record, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|key| match record.get(*key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Map an arbitrary record onto the contact schema.
pub fn contact_from_record(record: &Record, tags: &[String]) -> NewContact {
    NewContact {
        first_name: pick(record, &["first_name", "firstName"]),
        last_name: pick(record, &["last_name", "lastName"]),
        email: pick(record, &["email"]),
        phone: pick(record, &["phone"]),
        company: pick(record, &["company", "organization"]),
        job_title: pick(record, &["job_title", "jobTitle", "title"]),
        linkedin_url: pick(record, &["linkedin_url", "linkedinUrl"]),
        website: pick(record, &["website"]),
        location: pick(record, &["location"]),
        source: SOURCE.to_string(),
        tags: tags.to_vec(),
    }
}

/// Writes every record to the owner's contacts and passes the dataset on.
pub struct PersistStep {
    store: Arc<dyn Store>,
}

impl PersistStep {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StepExecutor for PersistStep {
    async fn execute(
        &self,
        dataset: Dataset,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<Dataset, StepError> {
        let config: PersistConfig = step.decode_config()?;
        let tags = config.tags.map(|t| t.normalized()).unwrap_or_default();

        if dataset.is_empty() {
            tracing::info!(run_id = %ctx.run_id, "Nothing to save");
            return Ok(dataset);
        }

        let contacts = dataset
            .iter()
            .map(|record| contact_from_record(record, &tags))
            .collect();

        let saved = self
            .store
            .insert_contacts(ctx.owner, contacts)
            .await
            .map_err(|e| StepError::PersistError(e.to_string()))?;

        tracing::info!(run_id = %ctx.run_id, saved, "Saved contacts");
        Ok(dataset)
    }
}
