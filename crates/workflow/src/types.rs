use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

use crate::{persona::AgentPersona, relay, WorkflowError};

const MAX_ID_LEN: usize = 128;

/// Immutable market context attached to a workflow at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowContext {
    pub symbols: Vec<String>,
    pub timeframe: Option<String>,
    pub risk_tolerance: Option<String>,
}

/// One entry of the `agents` list in a start request: either a bare persona
/// id or a persona with an explicit task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(untagged)]
pub enum AgentSelector {
    Id(String),
    WithTask {
        agent: String,
        #[serde(default)]
        task: Option<String>,
    },
}

/// A step as fixed at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PlannedStep {
    pub agent: AgentPersona,
    pub task: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Processing => write!(f, "processing"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "processing" => Ok(WorkflowStatus::Processing),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("unknown workflow status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Processing => write!(f, "processing"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "processing" => Ok(StepStatus::Processing),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

/// The workflow record, stored at `workflows/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub agents: Vec<PlannedStep>,
    pub context: WorkflowContext,
    pub stream_key: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowRecord {
    pub fn total_steps(&self) -> usize {
        self.agents.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Relay channel this workflow's events are routed to.
    pub fn channel_key(&self) -> String {
        match &self.stream_key {
            Some(key) => key.clone(),
            None => relay::workflow_channel(&self.id),
        }
    }
}

/// Dispatch record of one step, stored at `workflows/{id}:step:{i}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub workflow_id: String,
    pub index: usize,
    pub agent: AgentPersona,
    pub task: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub attempt: u32,
    pub error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn dispatched(workflow_id: &str, index: usize, step: &PlannedStep, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            index,
            agent: step.agent,
            task: step.task.clone(),
            status: StepStatus::Processing,
            started_at: now,
            attempt: 1,
            error: None,
            failed_at: None,
        }
    }
}

/// Result record of one step, stored at `workflows/{id}:result:{i}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResultRecord {
    pub workflow_id: String,
    pub index: usize,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

/// Body of `POST /api/workflows`.
#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub user_id: String,
    pub message: String,
    pub agents: Vec<AgentSelector>,
    #[serde(default)]
    pub context: Option<WorkflowContext>,
    #[serde(default)]
    pub stream_key: Option<String>,
}

/// A start request that passed validation.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub steps: Vec<PlannedStep>,
    pub context: WorkflowContext,
    pub stream_key: Option<String>,
}

fn validate_key(kind: &str, value: &str) -> Result<(), WorkflowError> {
    if value.is_empty() {
        return Err(WorkflowError::InvalidRequest(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(WorkflowError::InvalidRequest(format!(
            "{kind} must be at most {MAX_ID_LEN} characters"
        )));
    }
    if value
        .chars()
        .any(|c| c == ':' || c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(WorkflowError::InvalidRequest(format!(
            "{kind} '{value}' contains a reserved character"
        )));
    }
    Ok(())
}

impl StartWorkflowRequest {
    /// Validate the request and resolve every agent to a persona and task.
    /// Nothing is persisted here.
    pub fn into_plan(self) -> Result<WorkflowPlan, WorkflowError> {
        let id = match self.workflow_id {
            Some(id) => {
                let id = id.trim().to_string();
                validate_key("workflowId", &id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let user_id = self.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(WorkflowError::InvalidRequest("userId must not be empty".into()));
        }
        if self.message.trim().is_empty() {
            return Err(WorkflowError::InvalidRequest("message must not be empty".into()));
        }

        let mut context = self.context.unwrap_or_default();
        if context.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(WorkflowError::InvalidRequest(
                "context.symbols must not contain empty entries".into(),
            ));
        }
        context.symbols = context
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .collect();

        let stream_key = match self.stream_key {
            Some(key) => {
                validate_key("streamKey", &key)?;
                if key == relay::MONITORING_CHANNEL {
                    return Err(WorkflowError::InvalidRequest(format!(
                        "streamKey '{key}' is reserved"
                    )));
                }
                Some(key)
            }
            None => None,
        };

        let steps = self
            .agents
            .into_iter()
            .enumerate()
            .map(|(index, selector)| {
                let (raw, task) = match selector {
                    AgentSelector::Id(raw) => (raw, None),
                    AgentSelector::WithTask { agent, task } => (agent, task),
                };
                let agent = AgentPersona::parse(&raw).ok_or_else(|| {
                    WorkflowError::InvalidRequest(format!("agents[{index}]: unknown agent '{raw}'"))
                })?;
                let task = match task.map(|t| t.trim().to_string()) {
                    Some(task) if !task.is_empty() => task,
                    _ => agent.describe_task(&self.message, &context.symbols),
                };
                Ok(PlannedStep { agent, task })
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        Ok(WorkflowPlan {
            id,
            user_id,
            message: self.message,
            steps,
            context,
            stream_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(body: Value) -> StartWorkflowRequest {
        serde_json::from_value(body).expect("request should deserialize")
    }

    #[test]
    fn agents_accept_ids_and_explicit_tasks() {
        let plan = request(json!({
            "workflowId": "wf-1",
            "userId": "u-1",
            "message": "Should I buy AAPL?",
            "agents": ["analyst", {"agent": "risk_manager", "task": "Stress test"}],
            "context": {"symbols": [" aapl "], "riskTolerance": "low"}
        }))
        .into_plan()
        .unwrap();

        assert_eq!(plan.id, "wf-1");
        assert_eq!(plan.context.symbols, vec!["AAPL"]);
        assert_eq!(plan.context.risk_tolerance.as_deref(), Some("low"));
        assert_eq!(plan.steps[0].agent, AgentPersona::Analyst);
        assert!(plan.steps[0].task.contains("AAPL"));
        assert_eq!(plan.steps[1].agent, AgentPersona::RiskManager);
        assert_eq!(plan.steps[1].task, "Stress test");
    }

    #[test]
    fn blank_task_falls_back_to_persona_default() {
        let plan = request(json!({
            "userId": "u-1",
            "message": "rates?",
            "agents": [{"agent": "economist", "task": "   "}]
        }))
        .into_plan()
        .unwrap();

        assert_eq!(
            plan.steps[0].task,
            AgentPersona::Economist.describe_task("rates?", &[])
        );
        assert!(Uuid::parse_str(&plan.id).is_ok(), "server generates a uuid id");
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let err = request(json!({
            "userId": "u-1",
            "message": "hi",
            "agents": ["analyst", "fortune-teller"]
        }))
        .into_plan()
        .unwrap_err();

        assert!(matches!(err, WorkflowError::InvalidRequest(msg) if msg.contains("agents[1]")));
    }

    #[test]
    fn reserved_characters_in_ids_are_rejected() {
        for id in ["a:b", "a/b", "", "with space"] {
            let result = request(json!({
                "workflowId": id,
                "userId": "u-1",
                "message": "hi",
                "agents": []
            }))
            .into_plan();
            assert!(result.is_err(), "id {id:?} should be rejected");
        }
    }

    #[test]
    fn monitoring_stream_key_is_reserved() {
        let err = request(json!({
            "userId": "u-1",
            "message": "hi",
            "agents": [],
            "streamKey": "monitoring"
        }))
        .into_plan()
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidRequest(_)));
    }

    #[test]
    fn empty_message_and_symbols_are_rejected() {
        assert!(request(json!({"userId": "u", "message": " ", "agents": []}))
            .into_plan()
            .is_err());
        assert!(request(json!({
            "userId": "u",
            "message": "m",
            "agents": [],
            "context": {"symbols": [""]}
        }))
        .into_plan()
        .is_err());
    }

    #[test]
    fn channel_key_prefers_stream_key() {
        let now = Utc::now();
        let mut record = WorkflowRecord {
            id: "wf-9".into(),
            user_id: "u".into(),
            message: "m".into(),
            agents: vec![],
            context: WorkflowContext::default(),
            stream_key: None,
            status: WorkflowStatus::Processing,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };
        assert_eq!(record.channel_key(), "workflow-wf-9");

        record.stream_key = Some("session-42".into());
        assert_eq!(record.channel_key(), "session-42");
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Processing,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<WorkflowStatus>(), Ok(status));
        }
        assert!("done".parse::<StepStatus>().is_err());
    }
}
