use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use relay_core::context::ExecutionContext;
use relay_core::ids::{RunId, ThreadId, UserId};
use relay_core::state::ExecutionState;
use relay_engine::{EngineError, RegistryHealth};
use relay_telemetry::{LogFilter, LogStoreError};

use crate::server::AppState;

/// EngineError → HTTP status mapping. The body carries the stable failure
/// reason alongside the human-readable message.
pub struct ApiError(pub EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidContext(_) => StatusCode::BAD_REQUEST,
            EngineError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateRun(_) => StatusCode::CONFLICT,
            EngineError::TerminalState { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "reason": self.0.failure_reason(),
        }));
        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub agent: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub agent_context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
    pub user_id: UserId,
    pub thread_id: ThreadId,
}

/// POST /runs: validate, register and spawn a run; 202 with the run_id.
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let user_id = UserId::from_raw(&req.user_id);
    let thread_id = req
        .thread_id
        .map(|t| ThreadId::from_raw(&t))
        .unwrap_or_default();

    let mut context = ExecutionContext::new(user_id, thread_id.clone())
        .with_permissions(req.permissions);
    context.agent_context = req.agent_context;

    let user_id = context.user_id.clone();
    let run_id = state.engine.start_run(context, &req.agent, req.input)?;
    info!(user_id = %user_id, run_id = %run_id, agent = %req.agent, "run accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            user_id,
            thread_id,
        }),
    ))
}

/// GET /runs/{user_id}/{run_id}: tracker snapshot.
pub async fn get_run(
    State(state): State<AppState>,
    Path((user_id, run_id)): Path<(String, String)>,
) -> Response {
    let user_id = UserId::from_raw(&user_id);
    let run_id = RunId::from_raw(&run_id);
    match state
        .engine
        .tracker()
        .get_execution_state(&user_id, &run_id)
    {
        Some(execution) => Json::<ExecutionState>(execution).into_response(),
        None => not_found("run"),
    }
}

/// POST /runs/{user_id}/{run_id}/cancel: request cooperative cancellation.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path((user_id, run_id)): Path<(String, String)>,
) -> Response {
    let user_id = UserId::from_raw(&user_id);
    let run_id = RunId::from_raw(&run_id);
    if state.engine.cancel_run(&user_id, &run_id) {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"cancelled": true})),
        )
            .into_response()
    } else {
        not_found("active run")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub registry: RegistryHealth,
    pub active_executions: usize,
    pub connections: usize,
}

/// GET /health: registry counters (lock-free) plus tracker and connection
/// counts.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        registry: state.engine.registry().get_registry_health(),
        active_executions: state.engine.tracker().active_count(),
        connections: state.connections.count(),
    })
}

/// POST /admin/executions/clear: test/admin reset of the tracker.
pub async fn clear_executions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.engine.tracker().clear_all_executions();
    info!(cleared = cleared, "execution tracker cleared");
    Json(serde_json::json!({"cleared": cleared}))
}

fn log_store_response(result: Result<Vec<relay_telemetry::StoredLog>, LogStoreError>) -> Response {
    match result {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /runs/{user_id}/{run_id}/logs: the run's persisted warn+ timeline,
/// oldest first. 404 when the deployment has no log store.
pub async fn run_logs(
    State(state): State<AppState>,
    Path((user_id, run_id)): Path<(String, String)>,
) -> Response {
    let Some(store) = &state.logs else {
        return not_found("log store");
    };
    log_store_response(store.for_run(&user_id, &run_id))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// GET /admin/logs: filtered warn+ logs across all runs, newest first.
pub async fn query_logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Response {
    let Some(store) = &state.logs else {
        return not_found("log store");
    };
    log_store_response(store.recent(&LogFilter {
        level: q.level,
        user_id: q.user_id,
        run_id: q.run_id,
        since: q.since,
        limit: q.limit,
    }))
}
