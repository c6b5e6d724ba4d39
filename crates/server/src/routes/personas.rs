use axum::{Router, response::Json, routing::get};
use utils::response::ApiResponse;
use workflow::persona::{PersonaInfo, persona_catalog};

use crate::DeploymentImpl;

pub async fn list_personas() -> Json<ApiResponse<Vec<PersonaInfo>>> {
    Json(ApiResponse::success(persona_catalog()))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/personas", get(list_personas))
}
