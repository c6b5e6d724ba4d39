use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{persona::AgentPersona, relay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvocationFailed,
    PersistenceFailed,
    Timeout,
    Cancelled,
    OperatorFailed,
}

/// Events emitted over a workflow's lifetime. Serialized with a `type` tag
/// holding the event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
    #[serde(rename = "workflow.started")]
    Started {
        workflow_id: String,
        user_id: String,
        agents: Vec<AgentPersona>,
        total_steps: usize,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "workflow.agent.started")]
    AgentStarted {
        workflow_id: String,
        step_index: usize,
        agent: AgentPersona,
        agent_name: String,
        task: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "workflow.agent.progress")]
    AgentProgress {
        workflow_id: String,
        step_index: usize,
        agent: AgentPersona,
        message: String,
        percentage: Option<u8>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "workflow.agent.completed")]
    AgentCompleted {
        workflow_id: String,
        step_index: usize,
        agent: AgentPersona,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "workflow.completed")]
    Completed {
        workflow_id: String,
        results: Vec<Value>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "workflow.error")]
    Error {
        workflow_id: String,
        step_index: Option<usize>,
        agent: Option<AgentPersona>,
        error: String,
        reason: ErrorReason,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "workflow.started",
            WorkflowEvent::AgentStarted { .. } => "workflow.agent.started",
            WorkflowEvent::AgentProgress { .. } => "workflow.agent.progress",
            WorkflowEvent::AgentCompleted { .. } => "workflow.agent.completed",
            WorkflowEvent::Completed { .. } => "workflow.completed",
            WorkflowEvent::Error { .. } => "workflow.error",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::Started { workflow_id, .. }
            | WorkflowEvent::AgentStarted { workflow_id, .. }
            | WorkflowEvent::AgentProgress { workflow_id, .. }
            | WorkflowEvent::AgentCompleted { workflow_id, .. }
            | WorkflowEvent::Completed { workflow_id, .. }
            | WorkflowEvent::Error { workflow_id, .. } => workflow_id,
        }
    }
}

/// An event together with the per-session stream key of its workflow.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub stream_key: Option<String>,
    pub event: WorkflowEvent,
}

impl RoutedEvent {
    pub fn channel(&self) -> String {
        match &self.stream_key {
            Some(key) => key.clone(),
            None => relay::workflow_channel(self.event.workflow_id()),
        }
    }
}

/// In-process, fire-and-forget event publication.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoutedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutedEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, stream_key: Option<&str>, event: WorkflowEvent) {
        tracing::debug!(
            "[EVENT_BUS] {} for workflow {}",
            event.name(),
            event.workflow_id()
        );
        // No subscribers is not an error
        let _ = self.sender.send(RoutedEvent {
            stream_key: stream_key.map(str::to_string),
            event,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Handed to an invoker so it can publish `workflow.agent.progress` for the
/// step it is running. Reports are dropped once that step has resolved.
#[derive(Clone)]
pub struct ProgressReporter {
    events: EventBus,
    workflow_id: String,
    stream_key: Option<String>,
    step_index: usize,
    agent: AgentPersona,
    live: Arc<AtomicBool>,
}

impl ProgressReporter {
    pub(crate) fn new(
        events: EventBus,
        workflow_id: String,
        stream_key: Option<String>,
        step_index: usize,
        agent: AgentPersona,
        live: Arc<AtomicBool>,
    ) -> Self {
        Self {
            events,
            workflow_id,
            stream_key,
            step_index,
            agent,
            live,
        }
    }

    /// Reporter that goes nowhere, for driving an invoker outside a workflow.
    pub fn detached(workflow_id: &str, step_index: usize, agent: AgentPersona) -> Self {
        Self::new(
            EventBus::new(1),
            workflow_id.to_string(),
            None,
            step_index,
            agent,
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn report(&self, message: impl Into<String>, percentage: Option<u8>) {
        if !self.is_live() {
            return;
        }
        self.events.emit(
            self.stream_key.as_deref(),
            WorkflowEvent::AgentProgress {
                workflow_id: self.workflow_id.clone(),
                step_index: self.step_index,
                agent: self.agent,
                message: message.into(),
                percentage: percentage.map(|p| p.min(100)),
                timestamp: Utc::now(),
            },
        );
    }
}
