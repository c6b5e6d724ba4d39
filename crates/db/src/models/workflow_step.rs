use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};

use super::workflow::WorkflowRowError;

/// Dispatch and result record of a single step, keyed by
/// `(workflow_id, step_index)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStepRow {
    pub workflow_id: String,
    pub step_index: i64,
    pub agent: String,
    pub task: String,
    pub status: String,
    pub attempt: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    /// JSON payload returned by the agent, NULL until the step completed
    pub result: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStepRow {
    /// Write the dispatch half of the row. `started_at` is only written on
    /// insert and the result columns are never touched here.
    pub async fn upsert_dispatch<'e, E>(executor: E, step: &WorkflowStepRow) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (workflow_id, step_index, agent, task, status, attempt, error, started_at, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(workflow_id, step_index) DO UPDATE SET
                agent = excluded.agent,
                task = excluded.task,
                status = excluded.status,
                attempt = excluded.attempt,
                error = excluded.error,
                failed_at = excluded.failed_at
            "#,
        )
        .bind(&step.workflow_id)
        .bind(step.step_index)
        .bind(&step.agent)
        .bind(&step.task)
        .bind(&step.status)
        .bind(step.attempt)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.failed_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Attach the agent's result to an already dispatched step.
    /// `completed_at` keeps its first value.
    pub async fn record_result(
        pool: &SqlitePool,
        workflow_id: &str,
        step_index: i64,
        result: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), WorkflowRowError> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET result = ?3, completed_at = COALESCE(completed_at, ?4)
            WHERE workflow_id = ?1 AND step_index = ?2
            "#,
        )
        .bind(workflow_id)
        .bind(step_index)
        .bind(result)
        .bind(completed_at)
        .execute(pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(WorkflowRowError::StepNotDispatched {
                workflow_id: workflow_id.to_string(),
                step_index,
            });
        }
        Ok(())
    }

    pub async fn find(
        pool: &SqlitePool,
        workflow_id: &str,
        step_index: i64,
    ) -> Result<Option<Self>, WorkflowRowError> {
        let row = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            SELECT workflow_id, step_index, agent, task, status, attempt, error,
                   started_at, failed_at, result, completed_at
            FROM workflow_steps
            WHERE workflow_id = ?1 AND step_index = ?2
            "#,
        )
        .bind(workflow_id)
        .bind(step_index)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: &str,
    ) -> Result<Vec<Self>, WorkflowRowError> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            SELECT workflow_id, step_index, agent, task, status, attempt, error,
                   started_at, failed_at, result, completed_at
            FROM workflow_steps
            WHERE workflow_id = ?1
            ORDER BY step_index ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}
