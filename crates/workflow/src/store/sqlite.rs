use async_trait::async_trait;
use db::{
    models::{
        workflow::{WorkflowRow, WorkflowRowError},
        workflow_step::WorkflowStepRow,
    },
    DBService,
};

use super::{StateKey, StoreError, WorkflowStore};
use crate::{
    persona::AgentPersona,
    types::{StepRecord, StepResultRecord, WorkflowRecord, WorkflowStatus},
};

/// Relational store: one `workflows` row per workflow and one
/// `workflow_steps` row per `(workflow_id, step_index)` holding both the
/// dispatch and the result half of a step.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    db: DBService,
}

impl SqliteWorkflowStore {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

impl From<WorkflowRowError> for StoreError {
    fn from(err: WorkflowRowError) -> Self {
        match err {
            WorkflowRowError::AlreadyExists(id) => StoreError::Duplicate(id),
            WorkflowRowError::NotFound(id) => {
                StoreError::Missing(StateKey::Workflow(&id).to_string())
            }
            WorkflowRowError::StepNotDispatched {
                workflow_id,
                step_index,
            } => StoreError::NotDispatched {
                workflow_id,
                index: step_index as usize,
            },
            other => StoreError::Database(other),
        }
    }
}

fn corrupt(key: StateKey<'_>, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn to_workflow_row(record: &WorkflowRecord) -> Result<WorkflowRow, StoreError> {
    Ok(WorkflowRow {
        id: record.id.clone(),
        user_id: record.user_id.clone(),
        message: record.message.clone(),
        agents: serde_json::to_string(&record.agents)?,
        context: serde_json::to_string(&record.context)?,
        stream_key: record.stream_key.clone(),
        status: record.status.to_string(),
        error: record.error.clone(),
        started_at: record.started_at,
        updated_at: record.updated_at,
        completed_at: record.completed_at,
    })
}

fn from_workflow_row(row: WorkflowRow) -> Result<WorkflowRecord, StoreError> {
    let key = StateKey::Workflow(&row.id);
    let agents = serde_json::from_str(&row.agents).map_err(|e| corrupt(key, e))?;
    let context = serde_json::from_str(&row.context).map_err(|e| corrupt(key, e))?;
    let status = row.status.parse().map_err(|e| corrupt(key, e))?;

    Ok(WorkflowRecord {
        id: row.id,
        user_id: row.user_id,
        message: row.message,
        agents,
        context,
        stream_key: row.stream_key,
        status,
        started_at: row.started_at,
        updated_at: row.updated_at,
        completed_at: row.completed_at,
        error: row.error,
    })
}

fn to_step_row(step: &StepRecord) -> WorkflowStepRow {
    WorkflowStepRow {
        workflow_id: step.workflow_id.clone(),
        step_index: step.index as i64,
        agent: step.agent.id().to_string(),
        task: step.task.clone(),
        status: step.status.to_string(),
        attempt: i64::from(step.attempt),
        error: step.error.clone(),
        started_at: step.started_at,
        failed_at: step.failed_at,
        result: None,
        completed_at: None,
    }
}

fn from_step_row(row: &WorkflowStepRow) -> Result<StepRecord, StoreError> {
    let index = row.step_index as usize;
    let key = StateKey::Step(&row.workflow_id, index);
    let agent = AgentPersona::parse(&row.agent)
        .ok_or_else(|| corrupt(key, format!("unknown agent '{}'", row.agent)))?;
    let status = row.status.parse().map_err(|e| corrupt(key, e))?;
    let attempt = u32::try_from(row.attempt).map_err(|e| corrupt(key, e))?;

    Ok(StepRecord {
        workflow_id: row.workflow_id.clone(),
        index,
        agent,
        task: row.task.clone(),
        status,
        started_at: row.started_at,
        attempt,
        error: row.error.clone(),
        failed_at: row.failed_at,
    })
}

fn result_from_step_row(row: &WorkflowStepRow) -> Result<Option<StepResultRecord>, StoreError> {
    let Some(raw) = row.result.as_deref() else {
        return Ok(None);
    };
    let index = row.step_index as usize;
    let key = StateKey::Result(&row.workflow_id, index);
    let result = serde_json::from_str(raw).map_err(|e| corrupt(key, e))?;
    let completed_at = row
        .completed_at
        .ok_or_else(|| corrupt(key, "result without completion time"))?;

    Ok(Some(StepResultRecord {
        workflow_id: row.workflow_id.clone(),
        index,
        result,
        completed_at,
    }))
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        first_step: Option<&StepRecord>,
    ) -> Result<(), StoreError> {
        let row = to_workflow_row(workflow)?;
        let step = first_step.map(to_step_row);
        WorkflowRow::create(&self.db.pool, &row, step.as_ref()).await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        WorkflowRow::find_by_id(&self.db.pool, id)
            .await?
            .map(from_workflow_row)
            .transpose()
    }

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let row = to_workflow_row(workflow)?;
        WorkflowRow::update_lifecycle(&self.db.pool, &row).await?;
        Ok(())
    }

    async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        WorkflowRow::find_recent(&self.db.pool, limit)
            .await?
            .into_iter()
            .map(from_workflow_row)
            .collect()
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        WorkflowRow::find_by_status(&self.db.pool, &status.to_string())
            .await?
            .into_iter()
            .map(from_workflow_row)
            .collect()
    }

    async fn put_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        WorkflowStepRow::upsert_dispatch(&self.db.pool, &to_step_row(step))
            .await
            .map_err(WorkflowRowError::from)?;
        Ok(())
    }

    async fn get_step(&self, id: &str, index: usize) -> Result<Option<StepRecord>, StoreError> {
        WorkflowStepRow::find(&self.db.pool, id, index as i64)
            .await?
            .as_ref()
            .map(from_step_row)
            .transpose()
    }

    async fn put_result(&self, result: &StepResultRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&result.result)?;
        WorkflowStepRow::record_result(
            &self.db.pool,
            &result.workflow_id,
            result.index as i64,
            &payload,
            result.completed_at,
        )
        .await?;
        Ok(())
    }

    async fn get_result(
        &self,
        id: &str,
        index: usize,
    ) -> Result<Option<StepResultRecord>, StoreError> {
        match WorkflowStepRow::find(&self.db.pool, id, index as i64).await? {
            Some(row) => result_from_step_row(&row),
            None => Ok(None),
        }
    }
}
