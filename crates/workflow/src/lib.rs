//! Multi-agent workflow orchestration.
//!
//! A workflow routes one user request through an ordered list of agent
//! personas, strictly one step at a time. The [`orchestrator`] owns the
//! lifecycle, the [`status`] projector derives client-facing progress from
//! persisted records, and the [`relay`] pushes events to live subscribers.

pub mod events;
pub mod invoker;
pub mod orchestrator;
pub mod persona;
pub mod relay;
pub mod status;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use thiserror::Error;

pub use events::{EventBus, ProgressReporter, RoutedEvent, WorkflowEvent};
pub use invoker::{AgentInvoker, AgentRequest, InvokerError};
pub use orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
pub use persona::AgentPersona;
pub use relay::{BroadcastRegistry, StreamRelay};
pub use status::{StatusProjector, StatusView};
pub use store::{StoreError, WorkflowStore};
pub use types::{StartWorkflowRequest, WorkflowRecord, WorkflowStatus};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("Step {index} is not the in-flight step of workflow {workflow_id}")]
    OutOfOrder { workflow_id: String, index: usize },

    #[error("Step {index} of workflow {workflow_id} already has a different result")]
    ConflictingResult { workflow_id: String, index: usize },

    #[error("Workflow {workflow_id} is already {status}")]
    Terminal {
        workflow_id: String,
        status: WorkflowStatus,
    },

    #[error("Step {index} of workflow {workflow_id} is not waiting for a retry")]
    StepNotStuck { workflow_id: String, index: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
