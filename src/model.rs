//! Workflow, run and contact records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::step::Step;
use crate::store::StoreError;

/// Unique identifier for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

/// The user owning workflows, runs and contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

macro_rules! uuid_id {
    ($($name:ident),*) => {
        $(
            impl $name {
                /// Generate a fresh random identifier.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

uuid_id!(WorkflowId, RunId, OwnerId);

/// A user-defined pipeline of steps.
///
/// The step list is captured into the job payload at dispatch, so edits made
/// while a run is in flight only affect later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub owner: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a new active workflow that has never run.
    pub fn new(owner: OwnerId, name: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            owner,
            name: name.into(),
            description: None,
            steps,
            is_active: true,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns true once no further mutation is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// `Running -> Running` is the re-dispatch of a retried job attempt.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary written on successful completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub items_processed: usize,
    pub items_found: usize,
}

/// Auditable record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub owner: OwnerId,
    pub status: RunStatus,
    pub progress: u8,
    pub result: Option<RunResult>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single mutation of a run record.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    /// Dispatch: mark running with progress 0.
    Start,
    /// Progress checkpoint after a step.
    Progress(u8),
    /// A job attempt failed but the queue will retry it.
    AttemptFailed { error: String },
    /// All steps succeeded.
    Complete {
        result: RunResult,
        at: DateTime<Utc>,
    },
    /// A step failed and no retry follows.
    Fail { error: String, at: DateTime<Utc> },
}

impl WorkflowRun {
    /// Create a run in `pending` state.
    pub fn pending(workflow_id: WorkflowId, owner: OwnerId) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            owner,
            status: RunStatus::Pending,
            progress: 0,
            result: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Apply an update, enforcing the status state machine.
    ///
    /// Terminal runs reject every update. Within an attempt progress is a
    /// high-water mark; `Start` resets it to zero.
    pub fn apply(&mut self, update: RunUpdate) -> Result<(), StoreError> {
        let next = match &update {
            RunUpdate::Start | RunUpdate::Progress(_) | RunUpdate::AttemptFailed { .. } => {
                RunStatus::Running
            }
            RunUpdate::Complete { .. } => RunStatus::Completed,
            RunUpdate::Fail { .. } => RunStatus::Failed,
        };

        let legal = match update {
            // Progress and attempt failures only make sense on a running run.
            RunUpdate::Progress(_) | RunUpdate::AttemptFailed { .. } => {
                self.status == RunStatus::Running
            }
            _ => self.status.can_transition_to(next),
        };
        if !legal {
            return Err(StoreError::IllegalTransition {
                run: self.id,
                from: self.status,
                to: next,
            });
        }

        match update {
            // Each attempt starts its progress from zero.
            RunUpdate::Start => {
                self.status = RunStatus::Running;
                self.progress = 0;
            }
            RunUpdate::Progress(p) => {
                self.progress = self.progress.max(p.min(100));
            }
            RunUpdate::AttemptFailed { error } => {
                self.error_message = Some(error);
            }
            RunUpdate::Complete { result, at } => {
                self.status = RunStatus::Completed;
                self.progress = 100;
                self.result = Some(result);
                self.error_message = None;
                self.completed_at = Some(at);
            }
            RunUpdate::Fail { error, at } => {
                self.status = RunStatus::Failed;
                self.error_message = Some(error);
                self.completed_at = Some(at);
            }
        }
        Ok(())
    }
}

/// Contact row ready to be inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewContact {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub linkedin_url: Option<String>,
    pub website: Option<String>,
    pub location: Option<String>,
    pub source: String,
    pub tags: Vec<String>,
}

/// A stored contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub owner: OwnerId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub linkedin_url: Option<String>,
    pub website: Option<String>,
    pub location: Option<String>,
    pub source: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    /// Materialize a new contact for `owner`.
    pub fn from_new(owner: OwnerId, new: NewContact) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            first_name: new.first_name,
            last_name: new.last_name,
            email: new.email,
            phone: new.phone,
            company: new.company,
            job_title: new.job_title,
            linkedin_url: new.linkedin_url,
            website: new.website,
            location: new.location,
            source: new.source,
            tags: new.tags,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> WorkflowRun {
        WorkflowRun::pending(WorkflowId::new(), OwnerId::new())
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut r = run();
        r.apply(RunUpdate::Start).unwrap();
        r.apply(RunUpdate::Progress(50)).unwrap();
        r.apply(RunUpdate::Complete {
            result: RunResult {
                items_processed: 2,
                items_found: 2,
            },
            at: Utc::now(),
        })
        .unwrap();

        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.progress, 100);
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut r = run();
        let err = r
            .apply(RunUpdate::Complete {
                result: RunResult::default(),
                at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert_eq!(r.status, RunStatus::Pending);
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let mut r = run();
        r.apply(RunUpdate::Start).unwrap();
        r.apply(RunUpdate::Fail {
            error: "boom".into(),
            at: Utc::now(),
        })
        .unwrap();

        assert!(r.apply(RunUpdate::Start).is_err());
        assert!(r.apply(RunUpdate::Progress(100)).is_err());
        assert_eq!(r.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_progress_never_decreases_within_attempt() {
        let mut r = run();
        r.apply(RunUpdate::Start).unwrap();
        r.apply(RunUpdate::Progress(67)).unwrap();
        r.apply(RunUpdate::Progress(33)).unwrap();
        assert_eq!(r.progress, 67);
    }

    #[test]
    fn test_restart_resets_progress() {
        let mut r = run();
        r.apply(RunUpdate::Start).unwrap();
        r.apply(RunUpdate::Progress(67)).unwrap();
        r.apply(RunUpdate::AttemptFailed {
            error: "timeout".into(),
        })
        .unwrap();

        r.apply(RunUpdate::Start).unwrap();
        assert_eq!(r.status, RunStatus::Running);
        assert_eq!(r.progress, 0);
        assert_eq!(r.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_status_strings() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("queued"), None);
    }
}
