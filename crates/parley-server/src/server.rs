use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_core::events::RawEvent;
use parley_core::ids::ThreadId;
use parley_engine::Coordinator;
use parley_telemetry::{LogQuery, SqliteLogSink};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Persisted warn+ logs; `None` when persistence is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("gateway is shutting down")]
    Unavailable,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Ingress accepts one event or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventsBody {
    Many(Vec<RawEvent>),
    One(Box<RawEvent>),
}

impl EventsBody {
    fn into_events(self) -> Vec<RawEvent> {
        match self {
            Self::Many(events) => events,
            Self::One(event) => vec![*event],
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(events_handler))
        .route("/v1/threads/{thread_id}/abort", post(abort_handler))
        .route("/v1/threads/{thread_id}/history", delete(clear_history_handler))
        .route("/v1/logs", get(logs_handler))
        .route("/v1/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The coordinator must already be running.
pub async fn start(
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { coordinator, logs });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Parley server started");

    let stop = CancellationToken::new();
    let server = {
        let stop = stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
                .ok();
        })
    };

    Ok(ServerHandle {
        port: local_addr.port(),
        stop,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    stop: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.server.await;
    }
}

/// Inbound events from the platform bridge.
async fn events_handler(
    State(state): State<AppState>,
    body: Result<Json<EventsBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if state.coordinator.is_shut_down() {
        return Err(ApiError::Unavailable);
    }
    let events = body.into_events();
    if let Some(bad) = events.iter().find(|e| e.thread_id.as_str().trim().is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "event {} has an empty threadId",
            bad.message.msg_id
        )));
    }

    let accepted = events.len();
    for event in events {
        state.coordinator.push(event);
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

async fn abort_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    let aborted = state.coordinator.abort(&ThreadId::from_raw(thread_id));
    Json(json!({ "aborted": aborted }))
}

async fn clear_history_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cleared = state
        .coordinator
        .clear_history(&ThreadId::from_raw(thread_id))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "cleared": cleared })))
}

/// Persisted warnings and errors, newest first.
async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sink = state
        .logs
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("log persistence is disabled".into()))?;
    let logs = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "logs": logs })))
}

/// Credential rotation counters and cooldown state.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "gateway": state.coordinator.gateway_stats(),
        "threads": state.coordinator.thread_count(),
        "activeGenerations": state.coordinator.active_generations(),
    }))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let (http_status, status) = if coordinator.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    } else {
        (StatusCode::OK, "healthy")
    };
    (
        http_status,
        Json(json!({
            "status": status,
            "threads": coordinator.thread_count(),
            "activeGenerations": coordinator.active_generations(),
        })),
    )
}
