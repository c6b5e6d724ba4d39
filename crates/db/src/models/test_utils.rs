use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{workflow::WorkflowRow, workflow_step::WorkflowStepRow};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

pub(crate) fn sample_workflow(id: &str, started_at: DateTime<Utc>) -> WorkflowRow {
    WorkflowRow {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        message: "How does AAPL look this quarter?".to_string(),
        agents: r#"[{"agent":"analyst","task":"Analyze AAPL"}]"#.to_string(),
        context: r#"{"symbols":["AAPL"]}"#.to_string(),
        stream_key: None,
        status: "processing".to_string(),
        error: None,
        started_at,
        updated_at: started_at,
        completed_at: None,
    }
}

pub(crate) fn sample_step(workflow_id: &str, step_index: i64) -> WorkflowStepRow {
    WorkflowStepRow {
        workflow_id: workflow_id.to_string(),
        step_index,
        agent: "analyst".to_string(),
        task: "Analyze AAPL".to_string(),
        status: "processing".to_string(),
        attempt: 1,
        error: None,
        started_at: Utc::now(),
        failed_at: None,
        result: None,
        completed_at: None,
    }
}
