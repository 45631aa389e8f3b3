//! Persistence interface for workflows, runs and contacts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::model::{
    Contact, NewContact, OwnerId, RunId, RunStatus, RunUpdate, Workflow, WorkflowId, WorkflowRun,
};

/// Error returned by a store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("run {run} cannot move from {from} to {to}")]
    IllegalTransition {
        run: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("storage error: {0}")]
    Backend(String),
}

/// Persistent store for the records the engine reads and writes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a workflow.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Fetch a workflow owned by `owner`.
    async fn get_workflow(
        &self,
        id: WorkflowId,
        owner: OwnerId,
    ) -> Result<Option<Workflow>, StoreError>;

    /// Record a successful run of the workflow.
    async fn mark_workflow_ran(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Create a `pending` run.
    async fn create_run(
        &self,
        workflow_id: WorkflowId,
        owner: OwnerId,
    ) -> Result<WorkflowRun, StoreError>;

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError>;

    /// All runs of a workflow, oldest first.
    async fn runs_for_workflow(&self, id: WorkflowId) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Apply an update to a run and return the new state.
    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<WorkflowRun, StoreError>;

    /// Insert contacts for `owner`, returning how many were written.
    async fn insert_contacts(
        &self,
        owner: OwnerId,
        contacts: Vec<NewContact>,
    ) -> Result<usize, StoreError>;

    async fn contacts_for_owner(&self, owner: OwnerId) -> Result<Vec<Contact>, StoreError>;
}

#[derive(Default)]
struct Tables {
    workflows: HashMap<WorkflowId, Workflow>,
    runs: Vec<WorkflowRun>,
    contacts: Vec<Contact>,
}

/// An in-process store.
///
/// Useful for testing or when running without a database.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.lock()?.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(
        &self,
        id: WorkflowId,
        owner: OwnerId,
    ) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .lock()?
            .workflows
            .get(&id)
            .filter(|w| w.owner == owner)
            .cloned())
    }

    async fn mark_workflow_ran(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let workflow = tables
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))?;
        workflow.last_run_at = Some(at);
        workflow.updated_at = at;
        Ok(())
    }

    async fn create_run(
        &self,
        workflow_id: WorkflowId,
        owner: OwnerId,
    ) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun::pending(workflow_id, owner);
        self.lock()?.runs.push(run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.lock()?.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn runs_for_workflow(&self, id: WorkflowId) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .filter(|r| r.workflow_id == id)
            .cloned()
            .collect())
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<WorkflowRun, StoreError> {
        let mut tables = self.lock()?;
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.apply(update)?;
        Ok(run.clone())
    }

    async fn insert_contacts(
        &self,
        owner: OwnerId,
        contacts: Vec<NewContact>,
    ) -> Result<usize, StoreError> {
        let count = contacts.len();
        let mut tables = self.lock()?;
        tables
            .contacts
            .extend(contacts.into_iter().map(|c| Contact::from_new(owner, c)));
        Ok(count)
    }

    async fn contacts_for_owner(&self, owner: OwnerId) -> Result<Vec<Contact>, StoreError> {
        Ok(self
            .lock()?
            .contacts
            .iter()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect())
    }
}
