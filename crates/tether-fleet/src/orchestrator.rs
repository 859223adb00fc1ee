//! Worker orchestration: provisioning, lifecycle, and timeout enforcement.
//!
//! The orchestrator owns every Task and WorkerInstance mutation. Racing
//! paths (worker callback, timeout timer, deadline sweep, cancellation)
//! all funnel through the store's per-worker compare-and-set; the first
//! writer wins and every loser observes a mismatch and stands down.
//!
//! Timers are an optimization, not the source of truth. Each provisioned
//! worker gets a spawned sleep task keyed by its ID, but the persisted
//! `deadline_at` is authoritative and the sweeper expires anything a lost
//! timer missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use tether_core::{Error, Result, TaskId, WorkerId};

use crate::config::FleetConfig;
use crate::metrics::FleetMetrics;
use crate::platform::{CreateWorkerRequest, WorkerPlatform};
use crate::store::{CasOutcome, FleetStore};
use crate::task::{Task, TaskStatus};
use crate::worker::{ResourceProfile, WorkerInstance, WorkerStatus};

/// Cap on re-read rounds when racing writers keep moving a worker.
const MAX_CAS_ROUNDS: usize = 4;

/// Terminal outcome a worker reported for its command.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Whether the command succeeded.
    pub success: bool,
    /// Reference to the output a successful run produced.
    pub output: Option<String>,
    /// Failure detail for an unsuccessful run.
    pub error_message: Option<String>,
    /// Final cost in USD, when the worker metered one.
    pub cost: Option<f64>,
}

impl WorkerReport {
    /// Creates a report for a successful run.
    #[must_use]
    pub const fn succeeded(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            cost: None,
        }
    }

    /// Creates a report for a failed run.
    #[must_use]
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(error_message.into()),
            cost: None,
        }
    }

    /// Attaches the worker-metered cost.
    #[must_use]
    pub const fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// How a worker report was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// The report won the terminal transition and was recorded.
    Applied,
    /// The worker was already terminal; the report changed nothing.
    Duplicate,
    /// No worker with that ID exists.
    UnknownWorker,
}

/// Which safety net expired a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCause {
    /// The in-process sleep timer armed at provisioning.
    Timer,
    /// The periodic deadline sweep.
    Sweep,
}

impl ExpiryCause {
    /// Returns a lowercase label suitable for logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Sweep => "sweep",
        }
    }
}

struct OrchestratorInner {
    config: FleetConfig,
    store: Arc<dyn FleetStore>,
    platform: Arc<dyn WorkerPlatform>,
    metrics: FleetMetrics,
    timers: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }
}

/// Provisions workers for tasks and drives their lifecycle to the end.
///
/// Cheap to clone; clones share the timer registry and talk to the same
/// store and provider.
#[derive(Clone)]
pub struct WorkerOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for WorkerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOrchestrator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl WorkerOrchestrator {
    /// Creates an orchestrator over the given store and compute provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the configuration is invalid.
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn FleetStore>,
        platform: Arc<dyn WorkerPlatform>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                platform,
                metrics: FleetMetrics::new(),
                timers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Fetches a task snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] when the task does not exist.
    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::resource_not_found("task", task_id))
    }

    /// Fetches a worker snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] when the worker does not exist.
    pub async fn worker(&self, worker_id: WorkerId) -> Result<WorkerInstance> {
        self.inner
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| Error::resource_not_found("worker", worker_id))
    }

    /// Creates a task and requests a worker for it.
    ///
    /// Returns the task and worker snapshots after provisioning has run
    /// its course; a provider rejection leaves the task `FAILED` rather
    /// than surfacing as an error, so callers always learn the IDs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty command or a zero
    /// timeout, or a store error.
    #[tracing::instrument(skip(self, command), fields(task_id = tracing::field::Empty))]
    pub async fn submit_task(
        &self,
        command: String,
        timeout_seconds: Option<u32>,
        max_retries: Option<u32>,
    ) -> Result<(Task, WorkerInstance)> {
        if command.trim().is_empty() {
            return Err(Error::InvalidInput("command must not be empty".to_string()));
        }
        let timeout_seconds = timeout_seconds.unwrap_or(self.inner.config.default_timeout_seconds);
        if timeout_seconds == 0 {
            return Err(Error::InvalidInput(
                "timeoutSeconds must be at least 1".to_string(),
            ));
        }

        let mut task = Task::new(command).with_timeout_seconds(timeout_seconds);
        if let Some(max_retries) = max_retries {
            task = task.with_max_retries(max_retries);
        }
        tracing::Span::current().record("task_id", tracing::field::display(task.id));
        self.inner.store.insert_task(&task).await?;

        let worker = self.request_worker(&task).await?;
        let task = self.task(task.id).await?;
        Ok((task, worker))
    }

    /// Provisions a worker for a task.
    ///
    /// The command text selects the resource profile: GPU keywords win
    /// over build keywords, build keywords win over the minimal default.
    /// On provider rejection the worker and task are marked failed and no
    /// retry is attempted; retrying is the caller's call, bounded by
    /// `task.max_retries`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when the task already has an active
    /// worker.
    #[tracing::instrument(
        skip(self, task),
        fields(task_id = %task.id, worker_id = tracing::field::Empty)
    )]
    pub async fn request_worker(&self, task: &Task) -> Result<WorkerInstance> {
        if let Some(existing) = self.inner.store.active_worker_for_task(task.id).await? {
            return Err(Error::conflict(format!(
                "task {} already has active worker {}",
                task.id, existing.id
            )));
        }

        let profile = ResourceProfile::classify(&task.command);
        let mut worker = WorkerInstance::new(task.id, profile, String::new(), task.timeout_seconds);
        worker.callback_url = self.inner.config.callback_url(worker.id);
        tracing::Span::current().record("worker_id", tracing::field::display(worker.id));

        self.inner.store.insert_worker(&worker).await?;
        self.refresh_active_gauge().await;

        let worker = match self
            .inner
            .store
            .cas_worker_status(worker.id, WorkerStatus::Requested, WorkerStatus::Provisioning)
            .await?
        {
            CasOutcome::Updated(worker) => worker,
            // A cancel arriving this early has already terminated the
            // record; its state stands.
            CasOutcome::StatusMismatch { .. } | CasOutcome::NotFound => {
                return self.worker(worker.id).await;
            }
        };
        self.inner.metrics.record_provisioned(profile);

        let mut queued = self.task(task.id).await?;
        if !queued.status.is_terminal() {
            queued.transition_to(TaskStatus::Queued)?;
            self.inner.store.update_task(&queued).await?;
        }

        self.arm_timeout(&worker);

        let request = CreateWorkerRequest::from_worker(&worker, task.command.clone());
        match self.inner.platform.create(&request).await {
            Ok(()) => self.record_provisioned_running(&worker).await,
            Err(err) => self.record_provisioning_failure(&worker, &err).await,
        }
    }

    /// Marks the worker running after a successful provider create.
    async fn record_provisioned_running(&self, worker: &WorkerInstance) -> Result<WorkerInstance> {
        match self
            .inner
            .store
            .cas_worker_status(worker.id, WorkerStatus::Provisioning, WorkerStatus::Running)
            .await?
        {
            CasOutcome::Updated(running) => {
                tracing::info!(
                    worker_id = %running.id,
                    profile = running.resource_profile.as_label(),
                    "worker running"
                );
                let mut task = self.task(running.task_id).await?;
                if !task.status.is_terminal() {
                    task.transition_to(TaskStatus::Running)?;
                    self.inner.store.update_task(&task).await?;
                }
                Ok(running)
            }
            // A very fast callback or a cancel got there first.
            CasOutcome::StatusMismatch { .. } | CasOutcome::NotFound => {
                self.worker(worker.id).await
            }
        }
    }

    /// Marks the worker and task failed after a provider rejection.
    async fn record_provisioning_failure(
        &self,
        worker: &WorkerInstance,
        cause: &Error,
    ) -> Result<WorkerInstance> {
        self.inner
            .metrics
            .record_provisioning_failure(worker.resource_profile);
        tracing::warn!(
            worker_id = %worker.id,
            error = %cause,
            "worker provisioning failed"
        );
        self.cancel_timer(worker.id);

        match self
            .inner
            .store
            .cas_worker_status(worker.id, WorkerStatus::Provisioning, WorkerStatus::Failed)
            .await?
        {
            CasOutcome::Updated(failed) => {
                let mut task = self.task(failed.task_id).await?;
                if !task.status.is_terminal() {
                    task.error_message = Some(format!("worker provisioning failed: {cause}"));
                    task.transition_to(TaskStatus::Failed)?;
                    self.inner.store.update_task(&task).await?;
                }
                self.teardown(failed.id, WorkerStatus::Failed).await;
            }
            CasOutcome::StatusMismatch { .. } | CasOutcome::NotFound => {}
        }
        self.worker(worker.id).await
    }

    /// Applies a worker's terminal report.
    ///
    /// Safe under races and redelivery: an unknown worker or an already
    /// terminal one is a no-op, and concurrent writers are serialized by
    /// the store's compare-and-set. A report that lands before the
    /// provisioning path recorded `RUNNING` steps through the missing
    /// states rather than being rejected.
    ///
    /// # Errors
    ///
    /// Returns a store error, or [`Error::Internal`] when the worker kept
    /// changing under the retry cap.
    #[tracing::instrument(
        skip(self, report),
        fields(worker_id = %worker_id, success = report.success)
    )]
    pub async fn finish_worker(
        &self,
        worker_id: WorkerId,
        report: WorkerReport,
    ) -> Result<ReportDisposition> {
        let target = if report.success {
            WorkerStatus::Completed
        } else {
            WorkerStatus::Failed
        };

        for _ in 0..MAX_CAS_ROUNDS {
            let Some(worker) = self.inner.store.get_worker(worker_id).await? else {
                return Ok(ReportDisposition::UnknownWorker);
            };
            if worker.status.is_terminal() {
                return Ok(ReportDisposition::Duplicate);
            }

            let step = if worker.status.can_transition_to(target) {
                target
            } else {
                match worker.status {
                    WorkerStatus::Requested => WorkerStatus::Provisioning,
                    _ => WorkerStatus::Running,
                }
            };

            match self
                .inner
                .store
                .cas_worker_status(worker_id, worker.status, step)
                .await?
            {
                CasOutcome::Updated(updated) if step == target => {
                    self.apply_report(updated, &report).await?;
                    return Ok(ReportDisposition::Applied);
                }
                CasOutcome::Updated(_) | CasOutcome::StatusMismatch { .. } => {}
                CasOutcome::NotFound => return Ok(ReportDisposition::UnknownWorker),
            }
        }
        Err(Error::internal(format!(
            "worker {worker_id} kept changing while applying its report"
        )))
    }

    /// Winner-side bookkeeping for an applied report.
    async fn apply_report(&self, mut worker: WorkerInstance, report: &WorkerReport) -> Result<()> {
        self.cancel_timer(worker.id);

        if let Some(cost) = report.cost {
            worker.cost_estimate = cost;
            self.inner.store.update_worker(&worker).await?;
        }

        match self.inner.store.get_task(worker.task_id).await? {
            Some(mut task) => {
                if task.status.is_terminal() {
                    tracing::warn!(
                        task_id = %task.id,
                        status = %task.status,
                        "task already terminal; report leaves it unchanged"
                    );
                } else {
                    let target = if report.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    // A report can outrun the provisioning path; step the
                    // task through the states it never saw recorded.
                    if task.status == TaskStatus::Pending {
                        task.transition_to(TaskStatus::Queued)?;
                    }
                    if task.status == TaskStatus::Queued && target == TaskStatus::Completed {
                        task.transition_to(TaskStatus::Running)?;
                    }
                    task.output_ref = report.output.clone();
                    task.error_message = report.error_message.clone();
                    task.transition_to(target)?;
                    self.inner.store.update_task(&task).await?;
                }
            }
            None => {
                tracing::warn!(
                    worker_id = %worker.id,
                    task_id = %worker.task_id,
                    "worker report for a missing task"
                );
            }
        }

        self.teardown(worker.id, worker.status).await;
        Ok(())
    }

    /// Expires a worker whose deadline has passed.
    ///
    /// Returns `Ok(true)` when this call performed the expiry; `Ok(false)`
    /// when the worker was already terminal, unknown, or lost the race to
    /// another writer.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    #[tracing::instrument(skip(self), fields(worker_id = %worker_id, cause = cause.as_label()))]
    pub async fn expire_worker(&self, worker_id: WorkerId, cause: ExpiryCause) -> Result<bool> {
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(worker) = self.inner.store.get_worker(worker_id).await? else {
                return Ok(false);
            };
            if worker.status.is_terminal() {
                return Ok(false);
            }

            // A worker that never reached the provider has no run to time
            // out; it is terminated directly.
            let target = if worker.status == WorkerStatus::Requested {
                WorkerStatus::Terminated
            } else {
                WorkerStatus::TimedOut
            };

            match self
                .inner
                .store
                .cas_worker_status(worker_id, worker.status, target)
                .await?
            {
                CasOutcome::Updated(expired) => {
                    self.cancel_timer(worker_id);
                    match cause {
                        ExpiryCause::Timer => self.inner.metrics.record_timeout(),
                        ExpiryCause::Sweep => self.inner.metrics.record_sweep_expired(),
                    }
                    tracing::warn!(
                        worker_id = %worker_id,
                        task_id = %expired.task_id,
                        cause = cause.as_label(),
                        "worker deadline expired"
                    );

                    match self.inner.store.get_task(expired.task_id).await? {
                        Some(mut task) if !task.status.is_terminal() => {
                            if task.status == TaskStatus::Pending {
                                task.transition_to(TaskStatus::Queued)?;
                            }
                            task.error_message = Some("Task timeout".to_string());
                            task.transition_to(TaskStatus::Timeout)?;
                            self.inner.store.update_task(&task).await?;
                        }
                        Some(_) => {}
                        None => {
                            tracing::warn!(
                                task_id = %expired.task_id,
                                "expired worker references a missing task"
                            );
                        }
                    }

                    if target == WorkerStatus::TimedOut {
                        self.teardown(worker_id, WorkerStatus::TimedOut).await;
                    } else {
                        self.inner.metrics.record_terminated();
                        self.refresh_active_gauge().await;
                    }
                    return Ok(true);
                }
                CasOutcome::StatusMismatch { .. } => {}
                CasOutcome::NotFound => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Cancels a task and tears down its active worker.
    ///
    /// Idempotent: cancelling an already cancelled task returns its
    /// snapshot unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] when the task does not exist,
    /// or [`Error::Conflict`] when it already finished some other way.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        let mut task = self.task(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Ok(task);
        }
        if task.status.is_terminal() {
            return Err(Error::conflict(format!(
                "task {task_id} already {}",
                task.status
            )));
        }

        task.transition_to(TaskStatus::Cancelled)?;
        self.inner.store.update_task(&task).await?;
        tracing::info!(task_id = %task_id, "task cancelled");

        if let Some(worker) = self.inner.store.active_worker_for_task(task_id).await? {
            self.cancel_timer(worker.id);
            self.teardown(worker.id, worker.status).await;
        }
        Ok(task)
    }

    /// Fetches the worker's log lines from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] when the worker does not
    /// exist, or the platform error.
    pub async fn worker_logs(&self, worker_id: WorkerId) -> Result<Vec<String>> {
        self.worker(worker_id).await?;
        self.inner.platform.logs(worker_id).await
    }

    /// Best-effort provider teardown followed by the terminal transition.
    ///
    /// Provider failures are logged and never block the transition; the
    /// worker is terminated from this system's point of view.
    async fn teardown(&self, worker_id: WorkerId, expected: WorkerStatus) {
        if let Err(err) = self.inner.platform.stop(worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %err, "best-effort stop failed");
        }
        if let Err(err) = self.inner.platform.delete(worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %err, "best-effort delete failed");
        }

        match self
            .inner
            .store
            .cas_worker_status(worker_id, expected, WorkerStatus::Terminated)
            .await
        {
            Ok(CasOutcome::Updated(_)) => {
                self.inner.metrics.record_terminated();
                tracing::info!(worker_id = %worker_id, "worker terminated");
            }
            Ok(CasOutcome::StatusMismatch { actual }) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    actual = actual.as_label(),
                    "worker moved during teardown"
                );
            }
            Ok(CasOutcome::NotFound) => {
                tracing::warn!(worker_id = %worker_id, "teardown target vanished");
            }
            Err(err) => {
                tracing::warn!(worker_id = %worker_id, error = %err, "teardown status update failed");
            }
        }
        self.refresh_active_gauge().await;
    }

    /// Arms the per-instance timeout timer.
    ///
    /// The sleep is computed from the persisted deadline at arm time; an
    /// expired deadline fires immediately.
    fn arm_timeout(&self, worker: &WorkerInstance) {
        let worker_id = worker.id;
        let deadline = worker.deadline_at;
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let orchestrator = WorkerOrchestrator { inner };
            if let Err(err) = orchestrator
                .expire_worker(worker_id, ExpiryCause::Timer)
                .await
            {
                tracing::warn!(worker_id = %worker_id, error = %err, "timer expiry failed");
            }
        });
        self.register_timer(worker_id, handle);
    }

    fn register_timer(&self, worker_id: WorkerId, handle: JoinHandle<()>) {
        match self.inner.timers.lock() {
            Ok(mut timers) => {
                if let Some(previous) = timers.insert(worker_id, handle) {
                    previous.abort();
                }
            }
            // Poisoned map: drop the timer; the sweeper still covers the
            // deadline.
            Err(_) => handle.abort(),
        }
    }

    fn cancel_timer(&self, worker_id: WorkerId) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            if let Some(handle) = timers.remove(&worker_id) {
                handle.abort();
            }
        }
    }

    async fn refresh_active_gauge(&self) {
        if let Ok(count) = self.inner.store.count_active_workers().await {
            self.inner.metrics.set_active_workers(count);
        }
    }
}
