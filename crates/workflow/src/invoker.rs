use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{events::ProgressReporter, persona::AgentPersona, types::WorkflowContext};

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("Agent rejected the task: {0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed agent response: {0}")]
    MalformedResponse(String),
    #[error("Invoker not configured: {0}")]
    NotConfigured(String),
}

/// Output of an earlier step, passed along so later agents can build on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorResult {
    pub index: usize,
    pub agent: AgentPersona,
    pub result: Value,
}

/// Everything an agent needs to run one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub workflow_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub agent: AgentPersona,
    pub task: String,
    pub message: String,
    pub context: WorkflowContext,
    pub previous_results: Vec<PriorResult>,
}

/// Performs the work of one step. Calls may be slow and may fail; the
/// orchestrator never holds a lock while awaiting one.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: AgentRequest,
        progress: ProgressReporter,
    ) -> Result<Value, InvokerError>;
}
