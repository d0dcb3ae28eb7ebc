//! Execution endpoints
//!
//! Launch, terminate and inspect pipeline runs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use dagrun_core::{PipelineSelector, RunId, RunRecord};
use worker_runner::{StartExecutionResult, TerminateExecutionResult, DEFAULT_MODE};

use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionRequest {
    pub selector: PipelineSelector,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type RouteError = (StatusCode, Json<ErrorResponse>);

fn default_mode() -> String {
    DEFAULT_MODE.to_string()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/executions - Launch a run
async fn create_execution(
    State(state): State<AppState>,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<StartExecutionResult>), RouteError> {
    info!(
        "Execute request for pipeline {} (mode {})",
        req.selector.name, req.mode
    );

    let launched = state
        .executor()
        .launch(req.selector, req.mode, req.config)
        .await;
    let result = StartExecutionResult::from_launch(launched).map_err(internal_error)?;

    let status = match result {
        StartExecutionResult::Success { .. } => StatusCode::ACCEPTED,
        StartExecutionResult::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(result)))
}

/// POST /api/v1/executions/{id}/terminate - Terminate a run
async fn terminate_execution(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<TerminateExecutionResult>), RouteError> {
    let run_id = RunId::from(run_id);
    let outcome = state
        .executor()
        .cancel(&run_id)
        .await
        .map_err(internal_error)?;

    let result = TerminateExecutionResult::from_outcome(run_id, &outcome);
    let status = match result {
        TerminateExecutionResult::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((status, Json(result)))
}

/// GET /api/v1/executions/{id} - Fetch a run record
async fn get_execution(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, RouteError> {
    let run_id = RunId::from(run_id);
    state
        .executor()
        .get_run(&run_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("Run {} not found", run_id)))
}

/// GET /api/v1/executions - List runs, oldest first
async fn list_executions(State(state): State<AppState>) -> Json<Vec<RunRecord>> {
    Json(state.executor().list_runs())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/executions",
            get(list_executions).post(create_execution),
        )
        .route("/api/v1/executions/{id}", get(get_execution))
        .route(
            "/api/v1/executions/{id}/terminate",
            post(terminate_execution),
        )
}

// ============================================================================
// Helpers
// ============================================================================

fn internal_error(error: impl std::fmt::Display) -> RouteError {
    error!("Execution request failed: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn not_found(error: impl Into<String>) -> RouteError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}
