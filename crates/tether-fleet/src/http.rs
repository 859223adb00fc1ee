//! HTTP API surface.
//!
//! Thin axum layer over the orchestrator: handlers parse, delegate, and
//! serialize. Domain errors map to HTTP statuses in one place via
//! [`ApiError`]; the callback route keeps its own status mapping through
//! [`CallbackResult`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use tether_core::{Error as CoreError, Result, TaskId, WorkerId};

use crate::metrics::FleetMetrics;
use crate::orchestrator::WorkerOrchestrator;
use crate::reconcile::{
    handle_worker_callback, CallbackError, CallbackResult, WorkerCallbackRequest,
};
use crate::sweeper::{DeadlineSweeper, SweepSummary};
use crate::task::Task;
use crate::worker::WorkerInstance;

/// API result type.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an error response for conflicting state.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Returns an error response for upstream provider failures.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "BAD_GATEWAY", message)
    }

    /// Returns an error response for upstream timeouts.
    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "GATEWAY_TIMEOUT", message)
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidId { message } | CoreError::InvalidInput(message) => {
                Self::bad_request(message)
            }
            CoreError::Auth { message } => Self::unauthorized(message),
            CoreError::ResourceNotFound { resource_type, id } => {
                Self::not_found(format!("{resource_type} not found: {id}"))
            }
            CoreError::Conflict { message } => Self::conflict(message),
            CoreError::InvalidStateTransition { from, to, reason } => {
                Self::conflict(format!("invalid transition {from} -> {to}: {reason}"))
            }
            CoreError::Transport { message, .. } | CoreError::Provisioning { message } => {
                Self::bad_gateway(message)
            }
            CoreError::Timeout { message } => Self::gateway_timeout(message),
            CoreError::Protocol { message }
            | CoreError::Store { message, .. }
            | CoreError::Serialization { message }
            | CoreError::Configuration { message }
            | CoreError::Internal { message } => Self::internal(message),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Request body for `POST /v1/tasks`.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(Serialize))]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    /// Command to run on the worker.
    pub command: String,
    /// Execution budget; the configured default applies when omitted.
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    /// Retry budget recorded on the task.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Response body for `POST /v1/tasks`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    /// The created task.
    pub task: Task,
    /// The worker provisioned for it.
    pub worker: WorkerInstance,
}

/// Response body for `GET /v1/workers/{worker_id}/logs`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct WorkerLogsResponse {
    /// Worker the logs belong to.
    pub worker_id: WorkerId,
    /// Log lines as returned by the platform.
    pub lines: Vec<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: WorkerOrchestrator,
    sweeper: Arc<DeadlineSweeper>,
    metrics: FleetMetrics,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &"<WorkerOrchestrator>")
            .field("sweeper", &"<DeadlineSweeper>")
            .finish()
    }
}

impl AppState {
    /// Creates application state over the orchestrator and sweeper.
    #[must_use]
    pub fn new(orchestrator: WorkerOrchestrator, sweeper: DeadlineSweeper) -> Self {
        Self {
            orchestrator,
            sweeper: Arc::new(sweeper),
            metrics: FleetMetrics::new(),
        }
    }
}

/// Builds the fleet router with all routes and middleware.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/{task_id}", get(get_task))
        .route("/v1/tasks/{task_id}/cancel", post(cancel_task))
        .route("/v1/workers/{worker_id}/callback", post(worker_callback))
        .route("/v1/workers/{worker_id}/logs", get(worker_logs))
        .route("/v1/sweep", post(run_sweep))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Binds the listener and serves until the shutdown token fires.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| CoreError::configuration(format!("failed to bind to {addr}: {err}")))?;

    tracing::info!(%addr, "fleet API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|err| CoreError::internal(format!("server error: {err}")))?;

    Ok(())
}

/// Liveness check; reports process health only, no dependency fan-out.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let (task, worker) = state
        .orchestrator
        .submit_task(request.command, request.timeout_seconds, request.max_retries)
        .await?;
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task, worker })))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    let task = state.orchestrator.task(task_id).await?;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    let task = state.orchestrator.cancel_task(task_id).await?;
    Ok(Json(task))
}

async fn worker_callback(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<WorkerId>,
    Json(request): Json<WorkerCallbackRequest>,
) -> Response {
    let result =
        handle_worker_callback(&state.orchestrator, &state.metrics, worker_id, request).await;
    callback_response(result)
}

async fn worker_logs(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<WorkerId>,
) -> ApiResult<Json<WorkerLogsResponse>> {
    let lines = state.orchestrator.worker_logs(worker_id).await?;
    Ok(Json(WorkerLogsResponse { worker_id, lines }))
}

async fn run_sweep(State(state): State<Arc<AppState>>) -> ApiResult<Json<SweepSummary>> {
    let summary = state.sweeper.sweep(Utc::now()).await?;
    Ok(Json(summary))
}

fn callback_response<T: Serialize>(result: CallbackResult<T>) -> Response {
    let status = StatusCode::from_u16(result.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match result {
        CallbackResult::Ok(body) => (status, Json(body)).into_response(),
        CallbackResult::BadRequest(error) | CallbackResult::NotFound(error) => {
            (status, Json(error)).into_response()
        }
        CallbackResult::InternalError(message) => (
            status,
            Json(CallbackError {
                error: "internal".to_string(),
                message,
            }),
        )
            .into_response(),
    }
}
