//! Job queue module.

pub mod memory;
pub mod store;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory::MemoryBackend;
pub use store::{BackendError, ClaimedJob, JobBackend, JobId, JobState, JobStatus, JobType, NewJob};
pub use worker::{JobContext, JobError, JobHandler, Queue, QueueBuilder, QueueError, QueueHandle};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteBackend;
