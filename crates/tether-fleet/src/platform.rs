//! Remote compute provider abstraction.
//!
//! The orchestrator provisions and tears down workers through
//! [`WorkerPlatform`] without knowing which provider backs them. Workers
//! are addressed by our [`WorkerId`] everywhere; the provider keys its
//! records by that name so no provider-side handle needs to be stored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::{AuthProvider, Error, Result, WorkerId};

use crate::worker::WorkerInstance;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioning request sent to the provider.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerRequest {
    /// Worker name on the provider side.
    pub worker_id: WorkerId,
    /// Shell command the worker runs.
    pub command: String,
    /// CPU cores to allocate.
    pub cpu_cores: u32,
    /// Memory to allocate, in gigabytes.
    pub memory_gb: u32,
    /// Dedicated GPUs to attach.
    pub gpu_count: u32,
    /// Hard execution budget in seconds.
    pub timeout_seconds: u32,
    /// URL the worker reports its outcome to.
    pub callback_url: String,
}

impl CreateWorkerRequest {
    /// Builds a request from a worker record and the command it runs.
    #[must_use]
    pub fn from_worker(worker: &WorkerInstance, command: impl Into<String>) -> Self {
        let profile = worker.resource_profile;
        Self {
            worker_id: worker.id,
            command: command.into(),
            cpu_cores: profile.cpu_cores(),
            memory_gb: profile.memory_gb(),
            gpu_count: profile.gpu_count(),
            timeout_seconds: worker.timeout_seconds(),
            callback_url: worker.callback_url.clone(),
        }
    }
}

/// Compute provider the fleet provisions workers on.
#[async_trait]
pub trait WorkerPlatform: Send + Sync {
    /// Creates a worker and starts its command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provisioning`] when the provider rejects the
    /// request.
    async fn create(&self, request: &CreateWorkerRequest) -> Result<()>;

    /// Stops a running worker.
    async fn stop(&self, worker_id: WorkerId) -> Result<()>;

    /// Deletes a worker's provider-side record.
    async fn delete(&self, worker_id: WorkerId) -> Result<()>;

    /// Fetches the worker's log lines.
    async fn logs(&self, worker_id: WorkerId) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    lines: Vec<String>,
}

/// [`WorkerPlatform`] backed by a provider's HTTP API.
///
/// Routes, relative to the configured base URL:
///
/// ```text
/// POST   {base}/workers               create
/// POST   {base}/workers/{id}/stop     stop
/// DELETE {base}/workers/{id}          delete
/// GET    {base}/workers/{id}/logs     logs
/// ```
///
/// A bearer token from the injected [`AuthProvider`] is attached to every
/// request.
pub struct HttpWorkerPlatform {
    base_url: String,
    auth: Arc<dyn AuthProvider>,
    client: reqwest::Client,
}

impl HttpWorkerPlatform {
    /// Creates a platform client for the provider at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|err| Error::configuration(format!("failed to build http client: {err}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            client,
        })
    }

    async fn check_status(
        response: reqwest::Response,
        worker_id: WorkerId,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth(format!("provider rejected credentials ({status})")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::resource_not_found("worker", worker_id));
        }
        if !status.is_success() {
            return Err(Error::transport(format!("provider returned {status}")));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for HttpWorkerPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpWorkerPlatform")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl WorkerPlatform for HttpWorkerPlatform {
    async fn create(&self, request: &CreateWorkerRequest) -> Result<()> {
        let token = self.auth.bearer_token().await?;
        let response = self
            .client
            .post(format!("{}/workers", self.base_url))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|err| Error::provisioning(format!("create request failed: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth(format!("provider rejected credentials ({status})")));
        }
        if !status.is_success() {
            return Err(Error::provisioning(format!(
                "provider rejected create ({status})"
            )));
        }
        Ok(())
    }

    async fn stop(&self, worker_id: WorkerId) -> Result<()> {
        let token = self.auth.bearer_token().await?;
        let response = self
            .client
            .post(format!("{}/workers/{worker_id}/stop", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| Error::transport_with_source("stop request failed", err))?;

        Self::check_status(response, worker_id).await?;
        Ok(())
    }

    async fn delete(&self, worker_id: WorkerId) -> Result<()> {
        let token = self.auth.bearer_token().await?;
        let response = self
            .client
            .delete(format!("{}/workers/{worker_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| Error::transport_with_source("delete request failed", err))?;

        Self::check_status(response, worker_id).await?;
        Ok(())
    }

    async fn logs(&self, worker_id: WorkerId) -> Result<Vec<String>> {
        let token = self.auth.bearer_token().await?;
        let response = self
            .client
            .get(format!("{}/workers/{worker_id}/logs", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| Error::transport_with_source("logs request failed", err))?;

        let response = Self::check_status(response, worker_id).await?;
        let body: LogsResponse = response
            .json()
            .await
            .map_err(|err| Error::protocol(format!("malformed logs response: {err}")))?;

        Ok(body.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use tether_core::{StaticTokenProvider, TaskId};

    use crate::worker::ResourceProfile;

    type Seen = Arc<Mutex<Vec<String>>>;

    async fn spawn_provider(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn platform(base_url: &str) -> HttpWorkerPlatform {
        let auth = Arc::new(StaticTokenProvider::new("provider-token"));
        HttpWorkerPlatform::new(base_url, auth).unwrap()
    }

    fn gpu_worker() -> WorkerInstance {
        WorkerInstance::new(
            TaskId::generate(),
            ResourceProfile::Gpu,
            "http://fleet.internal/v1/workers/w/callback",
            1800,
        )
    }

    #[tokio::test]
    async fn create_posts_sizing_and_bearer_token() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let app = Router::new().route(
            "/v1/workers",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let recorded = recorded.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    recorded.lock().unwrap().push(auth);
                    recorded.lock().unwrap().push(body.to_string());
                    StatusCode::CREATED
                }
            }),
        );
        let base = spawn_provider(app).await;

        let worker = gpu_worker();
        let request = CreateWorkerRequest::from_worker(&worker, "python train.py");
        platform(&base).create(&request).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "Bearer provider-token");
        let body: serde_json::Value = serde_json::from_str(&seen[1]).unwrap();
        assert_eq!(body["workerId"], worker.id.to_string());
        assert_eq!(body["command"], "python train.py");
        assert_eq!(body["cpuCores"], 8);
        assert_eq!(body["memoryGb"], 32);
        assert_eq!(body["gpuCount"], 1);
        assert_eq!(body["timeoutSeconds"], 1800);
        assert_eq!(body["callbackUrl"], worker.callback_url);
    }

    #[tokio::test]
    async fn create_rejection_maps_to_provisioning_error() {
        let app = Router::new().route(
            "/v1/workers",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = spawn_provider(app).await;

        let worker = gpu_worker();
        let request = CreateWorkerRequest::from_worker(&worker, "true");
        let err = platform(&base).create(&request).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }), "got {err}");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let app = Router::new().route(
            "/v1/workers/{worker_id}/stop",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let base = spawn_provider(app).await;

        let err = platform(&base).stop(WorkerId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }), "got {err}");
    }

    #[tokio::test]
    async fn stop_and_delete_hit_lifecycle_routes() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let stop_seen = seen.clone();
        let delete_seen = seen.clone();
        let app = Router::new()
            .route(
                "/v1/workers/{worker_id}/stop",
                post(move |Path(worker_id): Path<String>| {
                    let seen = stop_seen.clone();
                    async move {
                        seen.lock().unwrap().push(format!("stop {worker_id}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/v1/workers/{worker_id}",
                delete(move |Path(worker_id): Path<String>| {
                    let seen = delete_seen.clone();
                    async move {
                        seen.lock().unwrap().push(format!("delete {worker_id}"));
                        StatusCode::NO_CONTENT
                    }
                }),
            );
        let base = spawn_provider(app).await;

        let worker_id = WorkerId::generate();
        let platform = platform(&base);
        platform.stop(worker_id).await.unwrap();
        platform.delete(worker_id).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], format!("stop {worker_id}"));
        assert_eq!(seen[1], format!("delete {worker_id}"));
    }

    #[tokio::test]
    async fn missing_worker_maps_to_not_found() {
        let app = Router::new().route(
            "/v1/workers/{worker_id}",
            delete(|| async { StatusCode::NOT_FOUND }),
        );
        let base = spawn_provider(app).await;

        let err = platform(&base).delete(WorkerId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }), "got {err}");
    }

    #[tokio::test]
    async fn logs_returns_provider_lines() {
        let app = Router::new().route(
            "/v1/workers/{worker_id}/logs",
            get(|| async {
                Json(serde_json::json!({ "lines": ["starting", "done"] }))
            }),
        );
        let base = spawn_provider(app).await;

        let lines = platform(&base).logs(WorkerId::generate()).await.unwrap();
        assert_eq!(lines, vec!["starting", "done"]);
    }
}
