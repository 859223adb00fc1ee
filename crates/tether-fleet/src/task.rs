//! Task model and lifecycle state machine.
//!
//! A [`Task`] is the unit of work a caller submits: a command to execute
//! remotely, a timeout budget, and a retry allowance. Status transitions
//! are monotonic; terminal states never roll back. A retry is a fresh
//! execution attempt created by the caller, not a status rollback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{Error, Result, TaskId};

/// Default execution budget when the caller does not set one.
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 3600;

/// Task lifecycle state machine.
///
/// ```text
/// ┌─────────┐     ┌────────┐     ┌─────────┐
/// │ PENDING │────▶│ QUEUED │────▶│ RUNNING │
/// └─────────┘     └────────┘     └─────────┘
///      │               │              │
///      │               │   ┌──────────┼──────────┐
///      │               ▼   ▼          ▼          ▼
///      │          ┌────────┐  ┌───────────┐ ┌─────────┐
///      └─────────▶│ FAILED │  │ COMPLETED │ │ TIMEOUT │
///   (cancelled)   └────────┘  └───────────┘ └─────────┘
/// ```
///
/// `CANCELLED` is reachable from every non-terminal state; `FAILED` and
/// `TIMEOUT` are reachable from `QUEUED` because provisioning can fail or
/// expire before the worker ever reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, no worker requested yet.
    Pending,
    /// Worker requested, provisioning in progress.
    Queued,
    /// Worker is executing the command.
    Running,
    /// Worker reported success.
    Completed,
    /// Provisioning failed or the worker reported failure.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// No callback arrived within the timeout budget.
    Timeout,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Returns true if the task is executing or waiting to execute.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Queued | Self::Cancelled),
            Self::Queued => matches!(
                target,
                Self::Running | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            Self::Running => matches!(
                target,
                Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// A unit of work submitted for remote execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identity.
    pub id: TaskId,
    /// Shell-style command text the worker executes.
    pub command: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Execution budget in seconds.
    pub timeout_seconds: u32,
    /// Execution attempts consumed so far.
    pub retry_count: u32,
    /// Attempts the caller allows beyond the first.
    pub max_retries: u32,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When a worker started executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reference to the output produced by a completed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Human-readable failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    /// Creates a pending task with default budgets.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            command: command.into(),
            status: TaskStatus::Pending,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_count: 0,
            max_retries: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_ref: None,
            error_message: None,
        }
    }

    /// Sets a custom execution budget.
    #[must_use]
    pub const fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Sets the retry allowance.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Applies a status change, validating the edge and stamping
    /// lifecycle timestamps.
    ///
    /// `started_at` is set on the first move to `RUNNING`; `completed_at`
    /// on the move to any terminal state. Neither is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when the edge is not in
    /// the [`TaskStatus::can_transition_to`] table.
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::invalid_transition(
                self.status.to_string(),
                status.to_string(),
                "not a valid task lifecycle edge",
            ));
        }
        if matches!(status, TaskStatus::Running) && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn provisioning_failure_skips_running() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Timeout));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn terminal_states_allow_no_transitions() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Pending));
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn cancel_is_reachable_from_all_active_states() {
        for active in [TaskStatus::Pending, TaskStatus::Queued, TaskStatus::Running] {
            assert!(active.is_active());
            assert!(active.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
        let parsed: TaskStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }

    #[test]
    fn task_serializes_camel_case() {
        let task = Task::new("echo hello").with_timeout_seconds(120);
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"timeoutSeconds\":120"));
        assert!(json.contains("\"maxRetries\":0"));
        assert!(json.contains("\"createdAt\""));
        assert!(!json.contains("outputRef"), "unset optionals are omitted");
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(TaskStatus::Timeout.to_string(), "TIMEOUT");
        assert_eq!(TaskStatus::Running.as_label(), "running");
    }

    #[test]
    fn transition_stamps_timestamps_once() {
        let mut task = Task::new("echo hi");
        task.transition_to(TaskStatus::Queued).unwrap();
        assert!(task.started_at.is_none());

        task.transition_to(TaskStatus::Running).unwrap();
        let started = task.started_at.expect("running stamps started_at");

        task.transition_to(TaskStatus::Completed).unwrap();
        assert_eq!(task.started_at, Some(started));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn transition_rejects_illegal_edges() {
        let mut task = Task::new("echo hi");
        let err = task.transition_to(TaskStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            tether_core::Error::InvalidStateTransition { .. }
        ));
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
