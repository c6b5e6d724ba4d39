//! Read-only projection of persisted workflow records into the status view
//! served to polling clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::{
    persona::AgentPersona,
    store::{StoreError, WorkflowStore},
    types::{StepStatus, WorkflowStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct StatusProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub index: usize,
    pub agent: AgentPersona,
    pub agent_name: String,
    pub task: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub progress: StatusProgress,
    pub steps: Vec<StepView>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<Value>,
}

impl StatusView {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Rounded to the nearest integer, halves up. Zero steps is 0%.
pub fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total);
    ((200 * completed + total) / (2 * total)) as u8
}

/// Overall status from step counts. `total == 0` counts as completed.
pub fn derive_status(completed: usize, processing: usize, total: usize) -> WorkflowStatus {
    if completed == total {
        WorkflowStatus::Completed
    } else if processing > 0 || completed > 0 {
        WorkflowStatus::Processing
    } else {
        WorkflowStatus::Pending
    }
}

#[derive(Clone)]
pub struct StatusProjector {
    store: Arc<dyn WorkflowStore>,
}

impl StatusProjector {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` when the workflow does not exist.
    pub async fn get_status(&self, workflow_id: &str) -> Result<Option<StatusView>, StoreError> {
        let Some(workflow) = self.store.get_workflow(workflow_id).await? else {
            return Ok(None);
        };

        let total = workflow.total_steps();
        let mut steps = Vec::with_capacity(total);
        let mut results = Vec::new();
        let mut completed = 0;
        let mut processing = 0;

        for (index, planned) in workflow.agents.iter().enumerate() {
            let result = self.store.get_result(workflow_id, index).await?;
            let dispatch = self.store.get_step(workflow_id, index).await?;

            let status = match (&result, &dispatch) {
                (Some(_), _) => StepStatus::Completed,
                (None, Some(step)) if step.status == StepStatus::Failed => StepStatus::Failed,
                (None, Some(_)) => StepStatus::Processing,
                (None, None) => StepStatus::Pending,
            };
            match status {
                StepStatus::Completed => completed += 1,
                StepStatus::Processing => processing += 1,
                _ => {}
            }

            let completed_at = result.as_ref().map(|r| r.completed_at);
            let result = result.map(|r| r.result);
            if let Some(value) = &result {
                results.push(value.clone());
            }

            steps.push(StepView {
                index,
                agent: planned.agent,
                agent_name: planned.agent.display_name().to_string(),
                task: planned.task.clone(),
                status,
                result,
                started_at: dispatch.as_ref().map(|s| s.started_at),
                completed_at,
                attempt: dispatch.as_ref().map(|s| s.attempt),
                error: dispatch.and_then(|s| s.error),
            });
        }

        let status = match workflow.status {
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => workflow.status,
            _ => derive_status(completed, processing, total),
        };

        Ok(Some(StatusView {
            workflow_id: workflow.id,
            status,
            progress: StatusProgress {
                completed,
                total,
                percentage: percentage(completed, total),
            },
            steps,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
            error: workflow.error,
            results,
        }))
    }
}
