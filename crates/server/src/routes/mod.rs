use axum::{
    Router, middleware,
    routing::{IntoMakeService, get},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{DeploymentImpl, middleware as app_middleware};

pub mod health;
pub mod personas;
pub mod streams;
pub mod workflows;

/// API routes without the outer layers, mounted under `/api`.
pub fn api_router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(personas::router())
        .merge(workflows::router(deployment))
        .merge(streams::router(deployment))
}

pub fn app(deployment: DeploymentImpl) -> Router {
    Router::new()
        .nest("/api", api_router(&deployment))
        .with_state(deployment)
        .layer(middleware::from_fn(app_middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    app(deployment).into_make_service()
}
