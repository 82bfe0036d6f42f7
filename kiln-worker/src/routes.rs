//! Axum route handlers for the worker API.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use kiln_core::{JobRequest, JobResponse};

use crate::error::JobFailure;
use crate::runner::JobRunner;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/run-job", post(run_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// `GET /` — static liveness answer.
pub async fn root() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({"message": "RCE server running..."})),
    )
}

/// `POST /run-job` — run one code cell in a fresh sandbox.
///
/// # Errors
/// `400` for validation failures (no VM is claimed); `500` with the
/// captured stdout/stderr body for execution failures.
pub async fn run_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobResponse>, JobFailure> {
    let response = state.runner.run(&req).await?;
    Ok(Json(response))
}
