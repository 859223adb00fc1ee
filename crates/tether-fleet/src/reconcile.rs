//! Worker callback reconciliation.
//!
//! Handlers here are framework-agnostic: they take parsed requests and
//! return response types with an HTTP status mapping. Routing and
//! serialization live in the API layer.
//!
//! Callbacks arrive asynchronously, possibly out of order, possibly more
//! than once. The contract is idempotent acceptance: a callback for an
//! unknown or already-terminal worker changes nothing and is acknowledged
//! as a duplicate with 200, never an error. Only a payload that
//! contradicts the record (wrong task, malformed fields) is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{Error, TaskId, TimingGuard, WorkerId};

use crate::metrics::FleetMetrics;
use crate::orchestrator::{ReportDisposition, WorkerOrchestrator, WorkerReport};

/// Worker-reported terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    /// The command succeeded.
    Completed,
    /// The command failed.
    Failed,
}

impl CallbackStatus {
    /// Returns a lowercase label suitable for logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Request body for `/v1/workers/{worker_id}/callback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCallbackRequest {
    /// Worker reporting the outcome; must match the callback path.
    pub worker_id: WorkerId,
    /// Task the worker was provisioned for.
    pub task_id: TaskId,
    /// Terminal status of the command.
    pub status: CallbackStatus,
    /// Reference to the output a successful run produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure detail for an unsuccessful run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Final metered cost in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Response body for an accepted callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCallbackResponse {
    /// Whether the callback changed state.
    pub acknowledged: bool,
    /// Whether this was a redelivery or a report for an unknown worker.
    pub duplicate: bool,
    /// Server timestamp.
    pub server_time: DateTime<Utc>,
}

impl WorkerCallbackResponse {
    /// Creates the response for a callback that was applied.
    #[must_use]
    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            duplicate: false,
            server_time: Utc::now(),
        }
    }

    /// Creates the response for a redelivered or unknown-worker callback.
    #[must_use]
    pub fn duplicate() -> Self {
        Self {
            acknowledged: false,
            duplicate: true,
            server_time: Utc::now(),
        }
    }
}

/// Error response for rejected callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackError {
    /// Error code.
    pub error: String,
    /// Human-readable message.
    pub message: String,
}

impl CallbackError {
    /// Creates an "invalid argument" error (400).
    #[must_use]
    pub fn invalid_argument(field: &str, message: &str) -> Self {
        Self {
            error: "invalid_argument".to_string(),
            message: format!("Invalid {field}: {message}"),
        }
    }

    /// Creates a "task mismatch" error (400).
    #[must_use]
    pub fn task_mismatch(expected: TaskId, received: TaskId) -> Self {
        Self {
            error: "task_mismatch".to_string(),
            message: format!("Worker belongs to task {expected}, received {received}"),
        }
    }

    /// Creates a "task not found" error (404).
    #[must_use]
    pub fn task_not_found(task_id: TaskId) -> Self {
        Self {
            error: "task_not_found".to_string(),
            message: format!("Task not found: {task_id}"),
        }
    }
}

/// Result type for callback handlers.
#[derive(Debug, Clone)]
pub enum CallbackResult<T> {
    /// Success (200 OK).
    Ok(T),
    /// Invalid request (400 Bad Request).
    BadRequest(CallbackError),
    /// Referenced task not found (404 Not Found).
    NotFound(CallbackError),
    /// Internal error (500).
    InternalError(String),
}

impl<T> CallbackResult<T> {
    /// Returns the HTTP status code for this result.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Ok(_) => 200,
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::InternalError(_) => 500,
        }
    }
}

fn finish_callback(
    metrics: &FleetMetrics,
    result: CallbackResult<WorkerCallbackResponse>,
) -> CallbackResult<WorkerCallbackResponse> {
    let outcome = match &result {
        CallbackResult::Ok(response) if response.duplicate => "duplicate",
        CallbackResult::Ok(_) => "acknowledged",
        CallbackResult::BadRequest(_) => "bad_request",
        CallbackResult::NotFound(_) => "not_found",
        CallbackResult::InternalError(_) => "error",
    };
    metrics.record_callback(outcome);
    result
}

/// Handles the `/v1/workers/{worker_id}/callback` webhook.
///
/// Validates the payload against the worker record, then applies the
/// report through the orchestrator; all state mutation happens behind
/// the orchestrator's public methods.
#[tracing::instrument(
    skip(orchestrator, metrics, request),
    fields(
        worker_id = %worker_id,
        task_id = tracing::field::Empty,
        status = tracing::field::Empty,
    )
)]
pub async fn handle_worker_callback(
    orchestrator: &WorkerOrchestrator,
    metrics: &FleetMetrics,
    worker_id: WorkerId,
    request: WorkerCallbackRequest,
) -> CallbackResult<WorkerCallbackResponse> {
    let timer = metrics.clone();
    let _guard = TimingGuard::new(move |duration| timer.observe_callback_duration(duration));

    let WorkerCallbackRequest {
        worker_id: body_worker_id,
        task_id,
        status,
        output,
        error_message,
        cost,
    } = request;
    tracing::Span::current().record("task_id", tracing::field::display(task_id));
    tracing::Span::current().record("status", status.as_label());

    if body_worker_id != worker_id {
        return finish_callback(
            metrics,
            CallbackResult::BadRequest(CallbackError::invalid_argument(
                "workerId",
                "does not match the callback path",
            )),
        );
    }
    if let Some(cost) = cost {
        if !cost.is_finite() || cost < 0.0 {
            return finish_callback(
                metrics,
                CallbackResult::BadRequest(CallbackError::invalid_argument(
                    "cost",
                    "must be a non-negative number",
                )),
            );
        }
    }

    let worker = match orchestrator.worker(worker_id).await {
        Ok(worker) => worker,
        Err(Error::ResourceNotFound { .. }) => {
            tracing::debug!(worker_id = %worker_id, "callback for unknown worker");
            return finish_callback(
                metrics,
                CallbackResult::Ok(WorkerCallbackResponse::duplicate()),
            );
        }
        Err(err) => {
            return finish_callback(metrics, CallbackResult::InternalError(err.to_string()));
        }
    };

    if worker.status.is_terminal() {
        tracing::debug!(
            worker_id = %worker_id,
            status = worker.status.as_label(),
            "callback for terminal worker"
        );
        return finish_callback(
            metrics,
            CallbackResult::Ok(WorkerCallbackResponse::duplicate()),
        );
    }

    if worker.task_id != task_id {
        return finish_callback(
            metrics,
            CallbackResult::BadRequest(CallbackError::task_mismatch(worker.task_id, task_id)),
        );
    }

    match orchestrator.task(task_id).await {
        Ok(_) => {}
        Err(Error::ResourceNotFound { .. }) => {
            return finish_callback(
                metrics,
                CallbackResult::NotFound(CallbackError::task_not_found(task_id)),
            );
        }
        Err(err) => {
            return finish_callback(metrics, CallbackResult::InternalError(err.to_string()));
        }
    }

    let report = WorkerReport {
        success: matches!(status, CallbackStatus::Completed),
        output,
        error_message,
        cost,
    };

    match orchestrator.finish_worker(worker_id, report).await {
        Ok(ReportDisposition::Applied) => finish_callback(
            metrics,
            CallbackResult::Ok(WorkerCallbackResponse::acknowledged()),
        ),
        Ok(ReportDisposition::Duplicate | ReportDisposition::UnknownWorker) => finish_callback(
            metrics,
            CallbackResult::Ok(WorkerCallbackResponse::duplicate()),
        ),
        Err(err) => finish_callback(metrics, CallbackResult::InternalError(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::config::FleetConfig;
    use crate::platform::{CreateWorkerRequest, WorkerPlatform};
    use crate::store::MemoryFleetStore;
    use crate::task::TaskStatus;
    use crate::worker::WorkerStatus;
    use tether_core::Result;

    #[derive(Debug, Default)]
    struct StubPlatform;

    #[async_trait]
    impl WorkerPlatform for StubPlatform {
        async fn create(&self, _request: &CreateWorkerRequest) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _worker_id: WorkerId) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _worker_id: WorkerId) -> Result<()> {
            Ok(())
        }

        async fn logs(&self, _worker_id: WorkerId) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn orchestrator() -> WorkerOrchestrator {
        WorkerOrchestrator::new(
            FleetConfig::new("http://fleet.test:7500"),
            Arc::new(MemoryFleetStore::new()),
            Arc::new(StubPlatform),
        )
        .expect("valid config")
    }

    fn callback(worker_id: WorkerId, task_id: TaskId, status: CallbackStatus) -> WorkerCallbackRequest {
        WorkerCallbackRequest {
            worker_id,
            task_id,
            status,
            output: None,
            error_message: None,
            cost: None,
        }
    }

    #[tokio::test]
    async fn completed_callback_is_acknowledged() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (task, worker) = orchestrator
            .submit_task("echo hi".to_string(), None, None)
            .await
            .unwrap();

        let mut request = callback(worker.id, task.id, CallbackStatus::Completed);
        request.output = Some("s3://results/7".to_string());
        request.cost = Some(0.31);

        let result = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;
        assert_eq!(result.status_code(), 200);
        let CallbackResult::Ok(response) = result else {
            panic!("expected Ok, got {result:?}");
        };
        assert!(response.acknowledged);
        assert!(!response.duplicate);

        let task = orchestrator.task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output_ref.as_deref(), Some("s3://results/7"));

        let worker = orchestrator.worker(worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Terminated);
        assert!((worker.cost_estimate - 0.31).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_callback_marks_the_task_failed() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (task, worker) = orchestrator
            .submit_task("false".to_string(), None, None)
            .await
            .unwrap();

        let mut request = callback(worker.id, task.id, CallbackStatus::Failed);
        request.error_message = Some("exit status 1".to_string());

        let result = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;
        assert_eq!(result.status_code(), 200);

        let task = orchestrator.task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("exit status 1"));
    }

    #[tokio::test]
    async fn unknown_worker_is_acknowledged_as_duplicate() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let worker_id = WorkerId::generate();

        let request = callback(worker_id, TaskId::generate(), CallbackStatus::Completed);
        let result = handle_worker_callback(&orchestrator, &metrics, worker_id, request).await;

        assert_eq!(result.status_code(), 200);
        let CallbackResult::Ok(response) = result else {
            panic!("expected Ok, got {result:?}");
        };
        assert!(!response.acknowledged);
        assert!(response.duplicate);
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_as_duplicate() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (task, worker) = orchestrator
            .submit_task("echo hi".to_string(), None, None)
            .await
            .unwrap();

        let request = callback(worker.id, task.id, CallbackStatus::Completed);
        let first =
            handle_worker_callback(&orchestrator, &metrics, worker.id, request.clone()).await;
        let CallbackResult::Ok(first) = first else {
            panic!("expected Ok");
        };
        assert!(first.acknowledged);

        let settled = orchestrator.task(task.id).await.unwrap();

        // Same payload again, and a contradictory one; neither changes state.
        let second = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;
        let CallbackResult::Ok(second) = second else {
            panic!("expected Ok");
        };
        assert!(second.duplicate);

        let mut contradicting = callback(worker.id, task.id, CallbackStatus::Failed);
        contradicting.cost = Some(99.0);
        let third =
            handle_worker_callback(&orchestrator, &metrics, worker.id, contradicting).await;
        assert_eq!(third.status_code(), 200);

        let after = orchestrator.task(task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
        assert_eq!(after.completed_at, settled.completed_at);
    }

    #[tokio::test]
    async fn task_mismatch_is_rejected() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (_task, worker) = orchestrator
            .submit_task("echo hi".to_string(), None, None)
            .await
            .unwrap();

        let request = callback(worker.id, TaskId::generate(), CallbackStatus::Completed);
        let result = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;

        assert_eq!(result.status_code(), 400);
        let CallbackResult::BadRequest(error) = result else {
            panic!("expected BadRequest, got {result:?}");
        };
        assert_eq!(error.error, "task_mismatch");

        // The worker is untouched by the rejected callback.
        let worker = orchestrator.worker(worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn path_and_body_worker_ids_must_agree() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (task, worker) = orchestrator
            .submit_task("echo hi".to_string(), None, None)
            .await
            .unwrap();

        let request = callback(WorkerId::generate(), task.id, CallbackStatus::Completed);
        let result = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;

        assert_eq!(result.status_code(), 400);
    }

    #[tokio::test]
    async fn negative_cost_is_rejected() {
        let orchestrator = orchestrator();
        let metrics = FleetMetrics::new();
        let (task, worker) = orchestrator
            .submit_task("echo hi".to_string(), None, None)
            .await
            .unwrap();

        let mut request = callback(worker.id, task.id, CallbackStatus::Completed);
        request.cost = Some(-1.0);
        let result = handle_worker_callback(&orchestrator, &metrics, worker.id, request).await;

        assert_eq!(result.status_code(), 400);
    }

    #[test]
    fn request_parses_camel_case_wire() {
        let worker_id = WorkerId::generate();
        let task_id = TaskId::generate();
        let json = format!(
            r#"{{"workerId": "{worker_id}", "taskId": "{task_id}", "status": "completed", "output": "s3://results/9", "cost": 0.5}}"#
        );

        let request: WorkerCallbackRequest = serde_json::from_str(&json).expect("parses");
        assert_eq!(request.worker_id, worker_id);
        assert_eq!(request.status, CallbackStatus::Completed);
        assert_eq!(request.output.as_deref(), Some("s3://results/9"));
        assert!(request.error_message.is_none());
    }

    #[test]
    fn response_serializes_camel_case_wire() {
        let response = WorkerCallbackResponse::duplicate();
        let json = serde_json::to_string(&response).expect("serializes");
        assert!(json.contains(r#""acknowledged":false"#));
        assert!(json.contains(r#""duplicate":true"#));
        assert!(json.contains("serverTime"));
    }

    #[test]
    fn status_codes_cover_every_variant() {
        assert_eq!(
            CallbackResult::Ok(WorkerCallbackResponse::acknowledged()).status_code(),
            200
        );
        let bad: CallbackResult<()> =
            CallbackResult::BadRequest(CallbackError::invalid_argument("cost", "negative"));
        assert_eq!(bad.status_code(), 400);
        let missing: CallbackResult<()> =
            CallbackResult::NotFound(CallbackError::task_not_found(TaskId::generate()));
        assert_eq!(missing.status_code(), 404);
        let broken: CallbackResult<()> =
            CallbackResult::InternalError("store offline".to_string());
        assert_eq!(broken.status_code(), 500);
    }
}
