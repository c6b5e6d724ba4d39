use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

use super::workflow_step::WorkflowStepRow;

#[derive(Debug, Error)]
pub enum WorkflowRowError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workflow already exists: {0}")]
    AlreadyExists(String),
    #[error("Workflow not found: {0}")]
    NotFound(String),
    #[error("Step {step_index} of workflow {workflow_id} has not been dispatched")]
    StepNotDispatched { workflow_id: String, step_index: i64 },
}

/// One multi-agent run. `agents` and `context` are JSON documents owned by the
/// workflow crate; this layer stores them verbatim.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRow {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub agents: String,
    pub context: String,
    pub stream_key: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}

impl WorkflowRow {
    /// Insert the workflow together with its first dispatched step.
    ///
    /// Both rows are written in one transaction: either the workflow exists
    /// with its step 0 record, or nothing was written.
    pub async fn create(
        pool: &SqlitePool,
        row: &WorkflowRow,
        first_step: Option<&WorkflowStepRow>,
    ) -> Result<(), WorkflowRowError> {
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflows
                (id, user_id, message, agents, context, stream_key, status, error,
                 started_at, updated_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.message)
        .bind(&row.agents)
        .bind(&row.context)
        .bind(&row.stream_key)
        .bind(&row.status)
        .bind(&row.error)
        .bind(row.started_at)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(WorkflowRowError::AlreadyExists(row.id.clone()));
            }
            return Err(err.into());
        }

        if let Some(step) = first_step {
            WorkflowStepRow::upsert_dispatch(&mut *tx, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> Result<Option<Self>, WorkflowRowError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, message, agents, context, stream_key, status, error,
                   started_at, updated_at, completed_at
            FROM workflows
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// Most recently started workflows first.
    pub async fn find_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, WorkflowRowError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, message, agents, context, stream_key, status, error,
                   started_at, updated_at, completed_at
            FROM workflows
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Workflows in the given lifecycle state, oldest first.
    pub async fn find_by_status(
        pool: &SqlitePool,
        status: &str,
    ) -> Result<Vec<Self>, WorkflowRowError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, message, agents, context, stream_key, status, error,
                   started_at, updated_at, completed_at
            FROM workflows
            WHERE status = ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(status)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Persist the mutable lifecycle columns. Everything else is fixed at creation.
    pub async fn update_lifecycle(
        pool: &SqlitePool,
        row: &WorkflowRow,
    ) -> Result<(), WorkflowRowError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?2, error = ?3, updated_at = ?4, completed_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&row.id)
        .bind(&row.status)
        .bind(&row.error)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkflowRowError::NotFound(row.id.clone()));
        }
        Ok(())
    }
}
