use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::poller::PollOptions;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Job queue location. Without it runs are created but never dispatched.
    pub broker_url: Option<String>,
    pub database_url: String,
    pub apify_api_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: Option<String>,
    pub scrape_concurrency: usize,
    pub workflow_concurrency: usize,
    pub poll_max_attempts: u32,
    pub poll_interval: Duration,
    pub queue_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            broker_url: optional("BROKER_URL"),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            apify_api_token: optional("APIFY_API_TOKEN"),
            anthropic_api_key: optional("ANTHROPIC_API_KEY"),
            anthropic_model: optional("ANTHROPIC_MODEL"),
            scrape_concurrency: parsed("SCRAPE_CONCURRENCY", 3)?,
            workflow_concurrency: parsed("WORKFLOW_CONCURRENCY", 2)?,
            poll_max_attempts: parsed("POLL_MAX_ATTEMPTS", 60)?,
            poll_interval: Duration::from_millis(parsed("POLL_INTERVAL_MS", 5000)?),
            queue_poll_interval: Duration::from_millis(parsed("QUEUE_POLL_INTERVAL_MS", 1000)?),
        };

        anyhow::ensure!(
            config.scrape_concurrency > 0 && config.workflow_concurrency > 0,
            "SCRAPE_CONCURRENCY and WORKFLOW_CONCURRENCY must be at least 1"
        );
        anyhow::ensure!(config.poll_max_attempts > 0, "POLL_MAX_ATTEMPTS must be at least 1");

        Ok(config)
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            max_attempts: self.poll_max_attempts,
            interval: self.poll_interval,
        }
    }
}

/// Unset and blank values both read as `None`.
fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        None => Ok(default),
    }
}
