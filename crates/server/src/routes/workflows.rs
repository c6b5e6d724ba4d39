use std::{convert::Infallible, time::Duration};

use axum::{
    Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use deployment::Deployment;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{Value, json};
use ts_rs::TS;
use utils::response::ApiResponse;
use workflow::{
    StartWorkflowRequest, StatusProjector, StatusView, WorkflowError, WorkflowRecord,
};

use crate::{DeploymentImpl, error::ApiError};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, TS)]
pub struct StepResultRequest {
    pub result: Value,
}

#[derive(Debug, Default, Deserialize, TS)]
pub struct FailWorkflowRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

pub async fn list_workflows(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRecord>>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let workflows = deployment.orchestrator().list_workflows(limit).await?;
    Ok(Json(ApiResponse::success(workflows)))
}

pub async fn start_workflow(
    State(deployment): State<DeploymentImpl>,
    body: Result<Json<StartWorkflowRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRecord>>), ApiError> {
    let request = parse_body(body)?;
    let workflow = deployment.orchestrator().start_workflow(request).await?;
    tracing::info!(
        "Started workflow {} for user {} with {} steps",
        workflow.id,
        workflow.user_id,
        workflow.total_steps()
    );
    Ok((StatusCode::CREATED, Json(ApiResponse::success(workflow))))
}

pub async fn get_workflow(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, ApiError> {
    let workflow = deployment.orchestrator().get_workflow(&workflow_id).await?;
    Ok(Json(ApiResponse::success(workflow)))
}

/// Polling view, returned bare rather than in the response envelope.
pub async fn get_status(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    match deployment.status().get_status(&workflow_id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(WorkflowError::NotFound(workflow_id).into()),
    }
}

struct StatusPoll {
    projector: StatusProjector,
    workflow_id: String,
    interval: Duration,
    last: Option<Value>,
    first: bool,
    done: bool,
}

/// Re-project the status every poll interval. A `status` event is sent when
/// the view changed; the stream ends after a terminal view. Unknown ids are
/// answered with 404 before the stream opens.
pub async fn stream_status(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    deployment.orchestrator().get_workflow(&workflow_id).await?;

    let interval = deployment.config().read().await.status_poll_interval();
    let poll = StatusPoll {
        projector: deployment.status().clone(),
        workflow_id,
        interval,
        last: None,
        first: true,
        done: false,
    };

    let stream = stream::unfold(poll, |mut poll| async move {
        if poll.done {
            return None;
        }
        if !poll.first {
            tokio::time::sleep(poll.interval).await;
        }
        poll.first = false;

        let event = match poll.projector.get_status(&poll.workflow_id).await {
            Ok(Some(view)) => {
                poll.done = view.is_terminal();
                let value = serde_json::to_value(&view).unwrap_or(Value::Null);
                if poll.last.as_ref() == Some(&value) {
                    Event::default().comment("keepalive")
                } else {
                    let event = Event::default().event("status").data(value.to_string());
                    poll.last = Some(value);
                    event
                }
            }
            Ok(None) => {
                poll.done = true;
                Event::default().event("error").data(
                    json!({ "error": "Workflow not found", "workflowId": poll.workflow_id })
                        .to_string(),
                )
            }
            Err(e) => {
                tracing::error!("Error projecting status of {}: {}", poll.workflow_id, e);
                Event::default().comment("error")
            }
        };
        Some((Ok(event), poll))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

pub async fn submit_step_result(
    State(deployment): State<DeploymentImpl>,
    Path((workflow_id, index)): Path<(String, usize)>,
    body: Result<Json<StepResultRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, ApiError> {
    let request = parse_body(body)?;
    let workflow = deployment
        .orchestrator()
        .advance_workflow(&workflow_id, index, request.result)
        .await?;
    Ok(Json(ApiResponse::success(workflow)))
}

pub async fn retry_step(
    State(deployment): State<DeploymentImpl>,
    Path((workflow_id, index)): Path<(String, usize)>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, ApiError> {
    let workflow = deployment
        .orchestrator()
        .retry_step(&workflow_id, index)
        .await?;
    Ok(Json(ApiResponse::success(workflow)))
}

pub async fn cancel_workflow(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, ApiError> {
    let workflow = deployment
        .orchestrator()
        .cancel_workflow(&workflow_id)
        .await?;
    Ok(Json(ApiResponse::success(workflow)))
}

pub async fn fail_workflow(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<String>,
    body: Option<Json<FailWorkflowRequest>>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, ApiError> {
    let reason = body
        .and_then(|Json(request)| request.reason)
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| "Failed by operator".to_string());
    let workflow = deployment
        .orchestrator()
        .fail_workflow(&workflow_id, &reason)
        .await?;
    Ok(Json(ApiResponse::success(workflow)))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/workflows", get(list_workflows).post(start_workflow))
        .route("/workflows/{workflow_id}", get(get_workflow))
        .route("/workflows/{workflow_id}/status", get(get_status))
        .route("/workflows/{workflow_id}/status/stream", get(stream_status))
        .route("/workflows/{workflow_id}/cancel", post(cancel_workflow))
        .route("/workflows/{workflow_id}/fail", post(fail_workflow))
        .route(
            "/workflows/{workflow_id}/steps/{index}/result",
            post(submit_step_result),
        )
        .route(
            "/workflows/{workflow_id}/steps/{index}/retry",
            post(retry_step),
        )
}
