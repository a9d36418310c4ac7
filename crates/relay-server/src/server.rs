use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use relay_core::ids::UserId;
use relay_engine::ExecutionEngine;
use relay_telemetry::RunLogStore;

use crate::channel::{self, ConnectionRegistry};
use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Capacity of each connection's event channel.
    pub channel_capacity: usize,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9290,
            channel_capacity: 256,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub connections: Arc<ConnectionRegistry>,
    /// Warn+ log store; `None` when the deployment runs without one.
    pub logs: Option<Arc<RunLogStore>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/runs", post(handlers::start_run))
        .route("/runs/{user_id}/{run_id}", get(handlers::get_run))
        .route("/runs/{user_id}/{run_id}/cancel", post(handlers::cancel_run))
        .route("/runs/{user_id}/{run_id}/logs", get(handlers::run_logs))
        .route("/health", get(handlers::health))
        .route("/admin/executions/clear", post(handlers::clear_executions))
        .route("/admin/logs", get(handlers::query_logs))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    engine: Arc<ExecutionEngine>,
    logs: Option<Arc<RunLogStore>>,
) -> Result<ServerHandle, std::io::Error> {
    let connections = Arc::new(ConnectionRegistry::new(config.channel_capacity));
    let _cleanup = channel::start_cleanup_task(Arc::clone(&connections), config.cleanup_interval);

    let state = AppState {
        engine,
        connections,
        logs,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _cleanup,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    user_id: String,
}

/// GET /ws?user_id=…: upgrade and bind the user's event delivery to this
/// socket. Reconnecting rebinds; the old socket stops receiving.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if params.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }
    let user_id = UserId::from_raw(&params.user_id);

    ws.on_upgrade(move |socket| async move {
        let (connection_id, events) = state.connections.register(&state.engine, user_id.clone());
        info!(connection_id = %connection_id, user_id = %user_id, "websocket connected");
        channel::handle_ws_connection(socket, connection_id, events, state.connections).await;
    })
}
