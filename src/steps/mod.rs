//! Built-in step executors.

mod ai_transform;
mod enrich;
mod filter;
mod persist;
mod scrape;

pub use ai_transform::{AiTransformConfig, AiTransformStep};
pub use enrich::{EnrichConfig, EnrichStep};
pub use filter::{FilterConfig, FilterOperator, FilterStep};
pub use persist::{contact_from_record, PersistConfig, PersistStep, Tags};
pub use scrape::{ScrapeConfig, ScrapeStep};

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::TaskProvider;
use crate::generate::TextGenerator;
use crate::poller::PollOptions;
use crate::step::{StepExecutor, StepKind};
use crate::store::Store;

/// Maps each step kind to its executor.
#[derive(Clone, Default)]
pub struct Executors {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl Executors {
    /// An empty registry. Every kind fails as unsupported until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in executors wired to their collaborators.
    pub fn standard(
        provider: Arc<dyn TaskProvider>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn Store>,
        poll: PollOptions,
    ) -> Self {
        Self::new()
            .with(StepKind::Scrape, ScrapeStep::new(provider, poll))
            .with(StepKind::Enrich, EnrichStep)
            .with(StepKind::Filter, FilterStep)
            .with(StepKind::AiTransform, AiTransformStep::new(generator))
            .with(StepKind::Persist, PersistStep::new(store))
    }

    /// Register or replace the executor for `kind`.
    pub fn with(mut self, kind: StepKind, executor: impl StepExecutor + 'static) -> Self {
        self.executors.insert(kind, Arc::new(executor));
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&kind)
    }
}
