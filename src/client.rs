//! External scraping task provider.
//!
//! A remote task is started once and its dataset fetched later, usually
//! through [`poll`](crate::poller::poll). [`ApifyClient`] talks to the Apify
//! REST API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::step::Record;

const BASE_URL: &str = "https://api.apify.com/v2";

/// Errors from the task provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("APIFY_API_TOKEN is not configured")]
    MissingCredential,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider did not return a run id")]
    MissingRunId,
}

/// Starts remote scraping tasks and fetches their results.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    /// Start a run of the task definition, returning the remote run id.
    async fn start(&self, task_def_id: &str, input: &Value) -> Result<String, ProviderError>;

    /// Fetch the run's records. `None` means not ready yet.
    async fn fetch_result(&self, remote_run_id: &str) -> Result<Option<Vec<Record>>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RunData {
    id: Option<String>,
}

/// Apify REST API client.
#[derive(Clone)]
pub struct ApifyClient {
    client: reqwest::Client,
    token: Option<String>,
    base_url: String,
}

impl ApifyClient {
    /// Create a client. Without a token every call fails with
    /// [`ProviderError::MissingCredential`].
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.filter(|t| !t.is_empty()),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Set a custom base URL (proxies, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.token.as_deref().ok_or(ProviderError::MissingCredential)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }
}

/// Apify addresses `user/actor` as `user~actor` in URLs.
fn actor_path(task_def_id: &str) -> String {
    task_def_id.replace('/', "~")
}

#[async_trait]
impl TaskProvider for ApifyClient {
    async fn start(&self, task_def_id: &str, input: &Value) -> Result<String, ProviderError> {
        let token = self.token()?;
        let url = format!("{}/acts/{}/runs", self.base_url, actor_path(task_def_id));

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(input)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let api_resp: ApiResponse<RunData> = resp.json().await?;
        let run_id = api_resp
            .data
            .id
            .filter(|id| !id.is_empty())
            .ok_or(ProviderError::MissingRunId)?;

        tracing::info!(actor = task_def_id, run_id = %run_id, "Apify run started");
        Ok(run_id)
    }

    async fn fetch_result(&self, remote_run_id: &str) -> Result<Option<Vec<Record>>, ProviderError> {
        let token = self.token()?;
        let url = format!(
            "{}/actor-runs/{}/dataset/items",
            self.base_url, remote_run_id
        );

        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        let resp = Self::check(resp).await?;

        let items: Vec<Record> = resp.json().await?;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(items))
    }
}
