use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use deployment::DeploymentError;
use serde_json::json;
use thiserror::Error;
use utils::response::ApiResponse;
use workflow::{StoreError, WorkflowError};

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Workflow(err) => match err {
                WorkflowError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
                WorkflowError::AlreadyExists(_)
                | WorkflowError::OutOfOrder { .. }
                | WorkflowError::ConflictingResult { .. }
                | WorkflowError::Terminal { .. }
                | WorkflowError::StepNotStuck { .. } => StatusCode::CONFLICT,
                WorkflowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(_) | ApiError::Deployment(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        // Unknown workflows get a dedicated body so pollers can tell them
        // apart from failures.
        if let ApiError::Workflow(WorkflowError::NotFound(workflow_id)) = &self {
            return (
                status_code,
                Json(json!({ "error": "Workflow not found", "workflowId": workflow_id })),
            )
                .into_response();
        }

        let message = if status_code.is_server_error() {
            tracing::error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status_code, Json(ApiResponse::<()>::error(&message))).into_response()
    }
}
