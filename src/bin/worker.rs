//! Leadflow Worker
//!
//! Runs the scrape and workflow worker pools against the configured
//! store and job queue until interrupted.

use anyhow::{Context, Result};
use leadflow::config::Config;
use leadflow::dispatch::{ScrapeJobHandler, WorkflowJobHandler};
use leadflow::queue::{JobType, QueueBuilder, SqliteBackend};
use leadflow::sqlite::SqliteStore;
use leadflow::steps::Executors;
use leadflow::{AnthropicClient, ApifyClient, Engine};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database URL: {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // Every connection to an in-memory database gets its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to {url}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,leadflow=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting Leadflow worker");

    let config = Config::from_env()?;

    let store = SqliteStore::new(connect(&config.database_url).await?);
    store
        .run_migrations()
        .await
        .context("Failed to migrate store")?;
    let store = Arc::new(store);

    let provider = Arc::new(ApifyClient::new(config.apify_api_token.clone()));
    let mut generator = AnthropicClient::new(config.anthropic_api_key.clone());
    if let Some(model) = &config.anthropic_model {
        generator = generator.with_model(model.clone());
    }

    let executors = Executors::standard(
        provider.clone(),
        Arc::new(generator),
        store.clone(),
        config.poll_options(),
    );
    let engine = Arc::new(Engine::new(store, executors));

    let Some(broker_url) = &config.broker_url else {
        tracing::warn!("BROKER_URL not set, no jobs will be processed");
        return Ok(());
    };

    let backend = SqliteBackend::new(connect(broker_url).await?);
    backend
        .run_migrations()
        .await
        .context("Failed to migrate job queue")?;

    let queue = QueueBuilder::new(backend)
        .handler(
            JobType::Scrape,
            ScrapeJobHandler::new(provider, config.poll_options()),
            config.scrape_concurrency,
        )
        .handler(
            JobType::Workflow,
            WorkflowJobHandler::new(engine),
            config.workflow_concurrency,
        )
        .poll_interval(config.queue_poll_interval)
        .build();

    let handle = queue.start().await;
    tracing::info!(
        scrape_workers = config.scrape_concurrency,
        workflow_workers = config.workflow_concurrency,
        "Worker pools running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;

    Ok(())
}
