//! # Leadflow
//!
//! Background execution engine for lead-generation workflows.
//!
//! A workflow is an ordered list of steps (scrape, enrich, filter,
//! AI transform, persist) that pass a dataset of JSON records from one to
//! the next. Each execution request creates a run record and puts a job on
//! a queue; worker pools pick the job up, run the steps and keep the run's
//! status and progress current.
//!
//! ## Why Leadflow?
//!
//! - **Durable runs** - Every execution is a run record with status, progress and outcome
//! - **Bounded workers** - One worker pool per job type with its own concurrency limit
//! - **Retries with backoff** - Failed jobs are re-attempted with exponential backoff
//! - **Degrades gracefully** - Without a queue, runs are still recorded
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leadflow::{Dispatcher, Engine, Executors, QueueBuilder, JobType};
//! use leadflow::dispatch::WorkflowJobHandler;
//!
//! let engine = Arc::new(Engine::new(store.clone(), Executors::standard(
//!     provider, generator, store.clone(), PollOptions::default(),
//! )));
//!
//! let queue = Arc::new(
//!     QueueBuilder::new(backend)
//!         .handler(JobType::Workflow, WorkflowJobHandler::new(engine), 2)
//!         .build(),
//! );
//! let handle = queue.start().await;
//!
//! let dispatcher = Dispatcher::new(store, Some(queue));
//! let execution = dispatcher.execute_workflow(workflow_id, owner).await?;
//! ```
//!
//! ## Custom Steps
//!
//! Any step kind can be served by your own executor:
//!
//! ```rust,ignore
//! let executors = Executors::new()
//!     .with(StepKind::Filter, MyFilter)
//!     .with(StepKind::Persist, PersistStep::new(store.clone()));
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable SQLite-backed storage and job queue

pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod generate;
pub mod model;
pub mod poller;
pub mod queue;
pub mod retry;
pub mod step;
pub mod steps;
pub mod store;

pub use client::{ApifyClient, ProviderError, TaskProvider};
pub use dispatch::{DispatchError, Dispatcher, Execution};
pub use engine::{AttemptInfo, Engine, EngineError, WorkflowJob};
pub use generate::{AnthropicClient, GenerateError, TextGenerator};
pub use model::{
    Contact, NewContact, OwnerId, RunId, RunResult, RunStatus, RunUpdate, Workflow, WorkflowId,
    WorkflowRun,
};
pub use poller::{poll, NoProgress, PollError, PollOptions, ProgressSink};
pub use queue::{JobId, JobState, JobStatus, JobType, Queue, QueueBuilder, QueueError};
pub use retry::RetryPolicy;
pub use step::{Dataset, Record, Step, StepContext, StepError, StepExecutor, StepKind};
pub use steps::Executors;
pub use store::{MemoryStore, Store, StoreError};

#[cfg(feature = "sqlite")]
pub mod sqlite;
