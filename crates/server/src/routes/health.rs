use axum::{extract::State, response::Json};
use deployment::Deployment;
use serde::Serialize;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

#[derive(Debug, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
    /// Channels with at least one live SSE or WebSocket subscriber
    pub live_channels: usize,
}

pub async fn health_check(
    State(deployment): State<DeploymentImpl>,
) -> Json<ApiResponse<HealthInfo>> {
    Json(ApiResponse::success(HealthInfo {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_channels: deployment.broadcasts().channel_count(),
    }))
}
