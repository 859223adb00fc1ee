//! Worker instance model, status machine, and resource sizing.
//!
//! A [`WorkerInstance`] is a provisioned remote execution unit bound to
//! exactly one task attempt. The [`ResourceProfile`] is chosen by a
//! keyword heuristic over the command text; the classifier is
//! deliberately fuzzy and falls back to the minimal profile.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{TaskId, WorkerId};

/// Command tokens that select the GPU profile.
const GPU_KEYWORDS: &[&str] = &[
    "train",
    "training",
    "finetune",
    "gpu",
    "cuda",
    "pytorch",
    "tensorflow",
    "inference",
];

/// Command tokens that select the build profile.
const BUILD_KEYWORDS: &[&str] = &[
    "build", "compile", "cargo", "make", "cmake", "gcc", "webpack", "bazel",
];

/// Worker lifecycle state machine.
///
/// ```text
/// ┌───────────┐   ┌──────────────┐   ┌─────────┐
/// │ REQUESTED │──▶│ PROVISIONING │──▶│ RUNNING │
/// └───────────┘   └──────┬───────┘   └────┬────┘
///                        │                │
///                        │ (create fail,  │ (callback or
///                        │  deadline)     │  deadline)
///                        ▼                ▼
///             ┌──────────────────────────────────────┐
///             │   COMPLETED │ FAILED │ TIMED_OUT     │
///             └──────────────────┬───────────────────┘
///                                │ teardown
///                                ▼
///                          ┌────────────┐
///                          │ TERMINATED │
///                          └────────────┘
/// ```
///
/// `PROVISIONING` reaches `FAILED` or `TIMED_OUT` but never `COMPLETED`.
/// Cancellation tears an active worker down directly
/// (`PROVISIONING`/`RUNNING` → `TERMINATED`) without an outcome state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Accepted, not yet submitted to the platform.
    Requested,
    /// Platform create call in flight.
    Provisioning,
    /// Executing the task command.
    Running,
    /// Callback reported success.
    Completed,
    /// Platform create failed or callback reported failure.
    Failed,
    /// Deadline passed with no callback.
    TimedOut,
    /// Remote resources released (or release attempted).
    Terminated,
}

impl WorkerStatus {
    /// Returns true while the worker occupies its task slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Requested | Self::Provisioning | Self::Running)
    }

    /// Returns true once the worker can no longer accept a callback.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Terminated
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Requested => matches!(target, Self::Provisioning | Self::Terminated),
            Self::Provisioning => matches!(
                target,
                Self::Running | Self::Failed | Self::TimedOut | Self::Terminated
            ),
            Self::Running => matches!(
                target,
                Self::Completed | Self::Failed | Self::TimedOut | Self::Terminated
            ),
            Self::Completed | Self::Failed | Self::TimedOut => {
                matches!(target, Self::Terminated)
            }
            Self::Terminated => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "REQUESTED"),
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Resource sizing tier for a remote worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceProfile {
    /// Minimal CPU and memory; the default.
    Minimal,
    /// Mid-tier CPU and memory for build and compile workloads.
    Build,
    /// GPU-class resources for ML and training workloads.
    Gpu,
}

impl ResourceProfile {
    /// Classifies a command into a profile by keyword heuristic.
    ///
    /// Matching is case-insensitive substring containment. When keywords
    /// from several tiers appear, GPU keywords win over build keywords,
    /// and build keywords win over the default.
    #[must_use]
    pub fn classify(command: &str) -> Self {
        let lowered = command.to_lowercase();
        if GPU_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return Self::Gpu;
        }
        if BUILD_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return Self::Build;
        }
        Self::Minimal
    }

    /// Returns the advisory hourly rate in USD.
    #[must_use]
    pub const fn hourly_rate_usd(&self) -> f64 {
        match self {
            Self::Minimal => 0.05,
            Self::Build => 0.20,
            Self::Gpu => 2.50,
        }
    }

    /// Returns the CPU core allocation.
    #[must_use]
    pub const fn cpu_cores(&self) -> u32 {
        match self {
            Self::Minimal => 1,
            Self::Build => 4,
            Self::Gpu => 8,
        }
    }

    /// Returns the memory allocation in gigabytes.
    #[must_use]
    pub const fn memory_gb(&self) -> u32 {
        match self {
            Self::Minimal => 2,
            Self::Build => 8,
            Self::Gpu => 32,
        }
    }

    /// Returns the GPU allocation.
    #[must_use]
    pub const fn gpu_count(&self) -> u32 {
        match self {
            Self::Minimal | Self::Build => 0,
            Self::Gpu => 1,
        }
    }

    /// Advisory cost for running at this tier for the full budget.
    ///
    /// Never reconciled against actual billing; replaced by the
    /// worker-reported cost when a callback carries one.
    #[must_use]
    pub fn estimated_cost(&self, timeout_seconds: u32) -> f64 {
        self.hourly_rate_usd() * f64::from(timeout_seconds) / 3600.0
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Build => "build",
            Self::Gpu => "gpu",
        }
    }
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self::Minimal
    }
}

/// A provisioned remote execution unit bound to one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInstance {
    /// Worker identity.
    pub id: WorkerId,
    /// Task this worker executes.
    pub task_id: TaskId,
    /// Current lifecycle state.
    pub status: WorkerStatus,
    /// Resource tier chosen for the command.
    pub resource_profile: ResourceProfile,
    /// Webhook the remote worker reports its outcome to.
    pub callback_url: String,
    /// Advisory cost in USD. Projected from the resource profile at
    /// request time; replaced by the worker-reported cost when a callback
    /// carries one.
    pub cost_estimate: f64,
    /// When the worker record was created.
    pub created_at: DateTime<Utc>,
    /// Authoritative expiry: `created_at + timeout_seconds`.
    ///
    /// Persisted so timers survive process restarts; the in-memory timer
    /// is an optimization over this value.
    pub deadline_at: DateTime<Utc>,
    /// When the worker began executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker stopped, for any reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkerInstance {
    /// Creates a requested worker for the given task.
    ///
    /// The deadline is derived from the task's timeout budget at creation
    /// time.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        resource_profile: ResourceProfile,
        callback_url: impl Into<String>,
        timeout_seconds: u32,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: WorkerId::generate(),
            task_id,
            status: WorkerStatus::Requested,
            resource_profile,
            callback_url: callback_url.into(),
            cost_estimate: resource_profile.estimated_cost(timeout_seconds),
            created_at,
            deadline_at: created_at + Duration::seconds(i64::from(timeout_seconds)),
            started_at: None,
            stopped_at: None,
        }
    }

    /// Execution budget in seconds, recovered from the persisted deadline.
    #[must_use]
    pub fn timeout_seconds(&self) -> u32 {
        let seconds = (self.deadline_at - self.created_at).num_seconds();
        u32::try_from(seconds).unwrap_or(0)
    }

    /// Applies a validated status change and stamps lifecycle timestamps.
    ///
    /// `started_at` is set on the first move to `RUNNING`; `stopped_at` on
    /// the first move to any terminal status. Neither is overwritten.
    pub fn apply_status(&mut self, status: WorkerStatus) {
        if matches!(status, WorkerStatus::Running) && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() && self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_picks_gpu_for_training_commands() {
        assert_eq!(
            ResourceProfile::classify("python train.py --epochs 10"),
            ResourceProfile::Gpu
        );
        assert_eq!(
            ResourceProfile::classify("CUDA_VISIBLE_DEVICES=0 ./run.sh"),
            ResourceProfile::Gpu
        );
    }

    #[test]
    fn classify_picks_build_for_compile_commands() {
        assert_eq!(
            ResourceProfile::classify("cargo test --workspace"),
            ResourceProfile::Build
        );
        assert_eq!(
            ResourceProfile::classify("make -j8 all"),
            ResourceProfile::Build
        );
    }

    #[test]
    fn classify_defaults_to_minimal() {
        assert_eq!(
            ResourceProfile::classify("echo hello && ls -la"),
            ResourceProfile::Minimal
        );
    }

    #[test]
    fn gpu_keywords_win_over_build_keywords() {
        assert_eq!(
            ResourceProfile::classify("make train-model"),
            ResourceProfile::Gpu
        );
    }

    #[test]
    fn cost_scales_with_budget() {
        let one_hour = ResourceProfile::Gpu.estimated_cost(3600);
        assert!((one_hour - 2.50).abs() < f64::EPSILON);
        let half_hour = ResourceProfile::Minimal.estimated_cost(1800);
        assert!((half_hour - 0.025).abs() < f64::EPSILON);
    }

    #[test]
    fn worker_lifecycle_transitions() {
        assert!(WorkerStatus::Requested.can_transition_to(WorkerStatus::Provisioning));
        assert!(WorkerStatus::Provisioning.can_transition_to(WorkerStatus::Running));
        assert!(WorkerStatus::Provisioning.can_transition_to(WorkerStatus::Failed));
        assert!(WorkerStatus::Running.can_transition_to(WorkerStatus::TimedOut));
        assert!(WorkerStatus::Completed.can_transition_to(WorkerStatus::Terminated));
        assert!(!WorkerStatus::Terminated.can_transition_to(WorkerStatus::Running));
        assert!(!WorkerStatus::Running.can_transition_to(WorkerStatus::Provisioning));
    }

    #[test]
    fn active_and_terminal_partition_the_states() {
        for status in [
            WorkerStatus::Requested,
            WorkerStatus::Provisioning,
            WorkerStatus::Running,
        ] {
            assert!(status.is_active());
            assert!(!status.is_terminal());
        }
        for status in [
            WorkerStatus::Completed,
            WorkerStatus::Failed,
            WorkerStatus::TimedOut,
            WorkerStatus::Terminated,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
    }

    #[test]
    fn deadline_derives_from_timeout() {
        let task_id = TaskId::generate();
        let worker = WorkerInstance::new(task_id, ResourceProfile::Minimal, "http://cb", 600);
        let budget = worker.deadline_at - worker.created_at;
        assert_eq!(budget.num_seconds(), 600);
        assert_eq!(worker.timeout_seconds(), 600);
        assert_eq!(worker.status, WorkerStatus::Requested);
    }

    #[test]
    fn worker_serializes_camel_case_wire() {
        let worker = WorkerInstance::new(
            TaskId::generate(),
            ResourceProfile::Gpu,
            "http://cb/v1/workers/x/callback",
            60,
        );
        let json = serde_json::to_string(&worker).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"resourceProfile\":\"GPU\""));
        assert!(json.contains("\"deadlineAt\""));
        assert!(json.contains("\"costEstimate\""));
    }
}
