//! Read-only HTTP status surface.
//!
//! Administration (CRUD on sources, rules and settings) lives elsewhere;
//! this server only reports what the pipeline is doing.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check (returns version) |
//! | `GET`  | `/status` | Queue depths, worker status, channel errors |
//! | `GET`  | `/items/{id}/log` | Processing log of one item |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "item abc not found" } }
//! ```

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::models::{ProcessingLogEntry, QueueDepths};
use crate::power::{PowerController, PowerSnapshot};
use crate::status::{StatusBoard, WorkerStatus};
use crate::store::Store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub board: StatusBoard,
    pub power: Option<Arc<PowerController>>,
    /// Recency window of the duplicate-check queue, in days (0 = unbounded).
    pub recency_days: i64,
}

#[derive(Debug, Serialize)]
pub struct ChannelStatus {
    pub id: i64,
    pub source: String,
    pub name: String,
    pub connector_type: String,
    pub enabled: bool,
    pub last_fetched_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub queues: QueueDepths,
    pub workers: BTreeMap<String, WorkerStatus>,
    pub power: Option<PowerSnapshot>,
    pub channels: Vec<ChannelStatus>,
}

/// Assemble the status report. Queue depths come from storage every time.
pub async fn status_report(state: &AppState) -> anyhow::Result<StatusReport> {
    let since = match state.recency_days {
        0 => None,
        days => Some(Utc::now().timestamp() - days * 86_400),
    };
    let queues = state.store.queue_depths(since).await?;
    let channels = state
        .store
        .list_channels()
        .await?
        .into_iter()
        .map(|c| ChannelStatus {
            id: c.id,
            source: c.source_name,
            name: c.name,
            connector_type: c.connector_type,
            enabled: c.enabled,
            last_fetched_at: c.last_fetched_at,
            last_error: c.last_error,
        })
        .collect();
    let power = match &state.power {
        Some(p) => Some(p.snapshot().await),
        None => None,
    };

    Ok(StatusReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        queues,
        workers: state.board.snapshot().await,
        power,
        channels,
    })
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/items/{id}/log", get(handle_item_log))
        .layer(cors)
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn run_server(
    bind_addr: &str,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusReport>, AppError> {
    status_report(&state).await.map(Json).map_err(internal)
}

async fn handle_item_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ProcessingLogEntry>>, AppError> {
    if state.store.get_item(&id).await.map_err(internal)?.is_none() {
        return Err(not_found(format!("item {} not found", id)));
    }
    let entries = state.store.log_entries(&id).await.map_err(internal)?;
    Ok(Json(entries))
}
