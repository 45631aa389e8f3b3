//! SQLite-based store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::model::{
    Contact, NewContact, OwnerId, RunId, RunResult, RunStatus, RunUpdate, Workflow, WorkflowId,
    WorkflowRun,
};
use crate::store::{Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lf_workflows (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    steps TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lf_workflow_runs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    owner TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    error_message TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS lf_contacts (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    email TEXT,
    phone TEXT,
    company TEXT,
    job_title TEXT,
    linkedin_url TEXT,
    website TEXT,
    location TEXT,
    source TEXT NOT NULL,
    tags TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lf_runs_workflow ON lf_workflow_runs(workflow_id, started_at);
CREATE INDEX IF NOT EXISTS idx_lf_contacts_owner ON lf_contacts(owner)
"#;

const UPDATE_ATTEMPTS: usize = 5;

const RUN_COLUMNS: &str =
    "id, workflow_id, owner, status, progress, result, error_message, started_at, completed_at";

/// SQLite-backed store for workflows, runs and contacts.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }
}

fn storage(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(storage)
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow, StoreError> {
    let id: String = row.try_get("id").map_err(storage)?;
    let owner: String = row.try_get("owner").map_err(storage)?;
    let steps: String = row.try_get("steps").map_err(storage)?;
    let is_active: i64 = row.try_get("is_active").map_err(storage)?;

    Ok(Workflow {
        id: WorkflowId(parse_uuid(&id)?),
        owner: OwnerId(parse_uuid(&owner)?),
        name: row.try_get("name").map_err(storage)?,
        description: row.try_get("description").map_err(storage)?,
        steps: serde_json::from_str(&steps).map_err(storage)?,
        is_active: is_active != 0,
        last_run_at: row.try_get("last_run_at").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, StoreError> {
    let id: String = row.try_get("id").map_err(storage)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(storage)?;
    let owner: String = row.try_get("owner").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let progress: i64 = row.try_get("progress").map_err(storage)?;
    let result: Option<String> = row.try_get("result").map_err(storage)?;

    Ok(WorkflowRun {
        id: RunId(parse_uuid(&id)?),
        workflow_id: WorkflowId(parse_uuid(&workflow_id)?),
        owner: OwnerId(parse_uuid(&owner)?),
        status: RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown run status '{status}'")))?,
        progress: progress.clamp(0, 100) as u8,
        result: result
            .map(|r| serde_json::from_str::<RunResult>(&r))
            .transpose()
            .map_err(storage)?,
        error_message: row.try_get("error_message").map_err(storage)?,
        started_at: row.try_get("started_at").map_err(storage)?,
        completed_at: row.try_get("completed_at").map_err(storage)?,
    })
}

fn contact_from_row(row: &SqliteRow) -> Result<Contact, StoreError> {
    let id: String = row.try_get("id").map_err(storage)?;
    let owner: String = row.try_get("owner").map_err(storage)?;
    let tags: String = row.try_get("tags").map_err(storage)?;

    Ok(Contact {
        id: parse_uuid(&id)?,
        owner: OwnerId(parse_uuid(&owner)?),
        first_name: row.try_get("first_name").map_err(storage)?,
        last_name: row.try_get("last_name").map_err(storage)?,
        email: row.try_get("email").map_err(storage)?,
        phone: row.try_get("phone").map_err(storage)?,
        company: row.try_get("company").map_err(storage)?,
        job_title: row.try_get("job_title").map_err(storage)?,
        linkedin_url: row.try_get("linkedin_url").map_err(storage)?,
        website: row.try_get("website").map_err(storage)?,
        location: row.try_get("location").map_err(storage)?,
        source: row.try_get("source").map_err(storage)?,
        tags: serde_json::from_str(&tags).map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let steps = serde_json::to_string(&workflow.steps).map_err(storage)?;

        sqlx::query(
            r#"
            INSERT INTO lf_workflows
                (id, owner, name, description, steps, is_active, last_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                steps = excluded.steps,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.owner.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(steps)
        .bind(workflow.is_active as i64)
        .bind(workflow.last_run_at)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_workflow(
        &self,
        id: WorkflowId,
        owner: OwnerId,
    ) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query("SELECT * FROM lf_workflows WHERE id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn mark_workflow_ran(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE lf_workflows SET last_run_at = ?, updated_at = ? WHERE id = ?")
                .bind(at)
                .bind(at)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("workflow {id}")));
        }
        Ok(())
    }

    async fn create_run(
        &self,
        workflow_id: WorkflowId,
        owner: OwnerId,
    ) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun::pending(workflow_id, owner);

        sqlx::query(
            "INSERT INTO lf_workflow_runs (id, workflow_id, owner, status, progress, started_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(workflow_id.to_string())
        .bind(owner.to_string())
        .bind(run.status.as_str())
        .bind(run.progress as i64)
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM lf_workflow_runs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_for_workflow(&self, id: WorkflowId) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM lf_workflow_runs WHERE workflow_id = ? ORDER BY started_at"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<WorkflowRun, StoreError> {
        // Each write is a single statement conditioned on the state it was
        // computed from, so no transaction has to upgrade a read lock.
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self
                .get_run(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;

            let mut run = current.clone();
            run.apply(update.clone())?;

            let result = run
                .result
                .map(|r| serde_json::to_string(&r))
                .transpose()
                .map_err(storage)?;

            let written = sqlx::query(
                r#"
                UPDATE lf_workflow_runs
                SET status = ?, progress = ?, result = ?, error_message = ?, completed_at = ?
                WHERE id = ? AND status = ? AND progress = ?
                "#,
            )
            .bind(run.status.as_str())
            .bind(run.progress as i64)
            .bind(result)
            .bind(&run.error_message)
            .bind(run.completed_at)
            .bind(id.to_string())
            .bind(current.status.as_str())
            .bind(current.progress as i64)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

            if written.rows_affected() == 1 {
                return Ok(run);
            }
        }

        Err(StoreError::Backend(format!(
            "run {id} kept changing during update"
        )))
    }

    async fn insert_contacts(
        &self,
        owner: OwnerId,
        contacts: Vec<NewContact>,
    ) -> Result<usize, StoreError> {
        let count = contacts.len();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        for new in contacts {
            let contact = Contact::from_new(owner, new);
            let tags = serde_json::to_string(&contact.tags).map_err(storage)?;

            sqlx::query(
                r#"
                INSERT INTO lf_contacts
                    (id, owner, first_name, last_name, email, phone, company, job_title,
                     linkedin_url, website, location, source, tags, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(contact.id.to_string())
            .bind(owner.to_string())
            .bind(&contact.first_name)
            .bind(&contact.last_name)
            .bind(&contact.email)
            .bind(&contact.phone)
            .bind(&contact.company)
            .bind(&contact.job_title)
            .bind(&contact.linkedin_url)
            .bind(&contact.website)
            .bind(&contact.location)
            .bind(&contact.source)
            .bind(tags)
            .bind(contact.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        // All rows land or none do.
        tx.commit().await.map_err(storage)?;
        Ok(count)
    }

    async fn contacts_for_owner(&self, owner: OwnerId) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM lf_contacts WHERE owner = ? ORDER BY created_at")
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter().map(contact_from_row).collect()
    }
}
