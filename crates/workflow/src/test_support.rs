use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    events::{ProgressReporter, RoutedEvent, WorkflowEvent},
    invoker::{AgentInvoker, AgentRequest, InvokerError},
    orchestrator::{OrchestratorConfig, WorkflowOrchestrator},
    persona::AgentPersona,
    store::{MemoryWorkflowStore, WorkflowStore},
    types::{PlannedStep, StepRecord, WorkflowContext, WorkflowRecord, WorkflowStatus},
    EventBus,
};

pub(crate) fn sample_record(id: &str, steps: usize) -> WorkflowRecord {
    let now = Utc::now();
    let agents = AgentPersona::ALL
        .iter()
        .cycle()
        .take(steps)
        .map(|agent| PlannedStep {
            agent: *agent,
            task: format!("{} task", agent.display_name()),
        })
        .collect();

    WorkflowRecord {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        message: "How does AAPL look?".to_string(),
        agents,
        context: WorkflowContext {
            symbols: vec!["AAPL".to_string()],
            ..Default::default()
        },
        stream_key: None,
        status: WorkflowStatus::Processing,
        started_at: now,
        updated_at: now,
        completed_at: None,
        error: None,
    }
}

pub(crate) fn sample_step(record: &WorkflowRecord, index: usize) -> StepRecord {
    StepRecord::dispatched(&record.id, index, &record.agents[index], Utc::now())
}

/// Invoker whose behaviour is chosen per step index.
#[derive(Default)]
pub(crate) struct ScriptedInvoker {
    /// Never resolves for these indices
    hang_on: HashSet<usize>,
    /// Rejects the first attempt at these indices
    fail_on: HashSet<usize>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub(crate) fn resolving() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn hanging_on(indices: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            hang_on: indices.iter().copied().collect(),
            ..Default::default()
        })
    }

    pub(crate) fn failing_on(indices: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            fail_on: indices.iter().copied().collect(),
            ..Default::default()
        })
    }

    pub(crate) fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn expected_result(request: &AgentRequest) -> Value {
        json!({
            "agent": request.agent,
            "response": format!("{} done", request.agent.display_name()),
        })
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: AgentRequest,
        progress: ProgressReporter,
    ) -> Result<Value, InvokerError> {
        self.calls.lock().unwrap().push(request.clone());
        progress.report(format!("{} working", request.agent), Some(50));

        if self.hang_on.contains(&request.step_index) {
            std::future::pending::<()>().await;
        }
        if self.fail_on.contains(&request.step_index) && request.attempt == 1 {
            return Err(InvokerError::Rejected("model unavailable".into()));
        }
        Ok(Self::expected_result(&request))
    }
}

pub(crate) struct Harness {
    pub orchestrator: WorkflowOrchestrator,
    pub store: Arc<MemoryWorkflowStore>,
    pub events: broadcast::Receiver<RoutedEvent>,
}

pub(crate) fn harness(invoker: Arc<dyn AgentInvoker>, step_timeout: Option<Duration>) -> Harness {
    let store = Arc::new(MemoryWorkflowStore::new());
    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let orchestrator = WorkflowOrchestrator::new(
        store.clone() as Arc<dyn WorkflowStore>,
        invoker,
        bus,
        OrchestratorConfig { step_timeout },
    );
    Harness {
        orchestrator,
        store,
        events,
    }
}

/// Receive events until one named `name` shows up for `workflow_id`.
pub(crate) async fn wait_for_event(
    events: &mut broadcast::Receiver<RoutedEvent>,
    workflow_id: &str,
    name: &str,
) -> WorkflowEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let routed = events.recv().await.expect("event bus closed");
            if routed.event.workflow_id() == workflow_id && routed.event.name() == name {
                return routed.event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name} on {workflow_id}"))
}

/// Drain whatever is queued right now.
pub(crate) fn drain(events: &mut broadcast::Receiver<RoutedEvent>) -> Vec<WorkflowEvent> {
    let mut seen = Vec::new();
    while let Ok(routed) = events.try_recv() {
        seen.push(routed.event);
    }
    seen
}
