//! System of record for workflows, step dispatches and step results.

pub mod memory;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use db::models::workflow::WorkflowRowError;
use thiserror::Error;

use crate::types::{StepRecord, StepResultRecord, WorkflowRecord, WorkflowStatus};

pub use memory::MemoryWorkflowStore;
pub use sqlite::SqliteWorkflowStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(WorkflowRowError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Record already exists: {0}")]
    Duplicate(String),
    #[error("Record not found: {0}")]
    Missing(String),
    #[error("Step {index} of workflow {workflow_id} has not been dispatched")]
    NotDispatched { workflow_id: String, index: usize },
}

/// Addresses of the records kept per workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey<'a> {
    Workflow(&'a str),
    Step(&'a str, usize),
    Result(&'a str, usize),
}

impl fmt::Display for StateKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Workflow(id) => write!(f, "workflows/{id}"),
            StateKey::Step(id, index) => write!(f, "workflows/{id}:step:{index}"),
            StateKey::Result(id, index) => write!(f, "workflows/{id}:result:{index}"),
        }
    }
}

/// Persistence seam used by the orchestrator and the status projector.
///
/// Writes are point operations keyed by workflow id and step index. A step
/// dispatch keeps the `started_at` of the first dispatch, and a result keeps
/// the `completed_at` of the first write.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Create the workflow and, when given, its first dispatch. Either both
    /// records exist afterwards or neither does.
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        first_step: Option<&StepRecord>,
    ) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Persist status, error and timestamps of an existing workflow.
    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    /// Most recently started first.
    async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Every workflow currently in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn put_step(&self, step: &StepRecord) -> Result<(), StoreError>;

    async fn get_step(&self, id: &str, index: usize) -> Result<Option<StepRecord>, StoreError>;

    /// Fails with [`StoreError::NotDispatched`] when the step has no dispatch record.
    async fn put_result(&self, result: &StepResultRecord) -> Result<(), StoreError>;

    async fn get_result(
        &self,
        id: &str,
        index: usize,
    ) -> Result<Option<StepResultRecord>, StoreError>;
}
