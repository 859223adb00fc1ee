//! Durable task and worker state behind an injected trait.
//!
//! The orchestrator keeps no in-process state of record; everything that
//! must survive a restart lives behind [`FleetStore`]. Status changes go
//! through [`FleetStore::cas_worker_status`], a per-worker compare-and-set
//! that serializes racing writers (callback vs timeout timer vs sweep):
//! the first writer wins and every loser observes a
//! [`CasOutcome::StatusMismatch`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tether_core::{Result, TaskId, WorkerId};

use crate::task::Task;
use crate::worker::{WorkerInstance, WorkerStatus};

pub use memory::MemoryFleetStore;

/// Outcome of a compare-and-set on a worker's status.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The status advanced; the updated record is returned.
    Updated(WorkerInstance),
    /// The current status differed from the expected one.
    StatusMismatch {
        /// The status actually found.
        actual: WorkerStatus,
    },
    /// No worker with that ID exists.
    NotFound,
}

impl CasOutcome {
    /// Returns true if the compare-and-set applied.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Storage contract for tasks and worker instances.
///
/// Implementations must make [`Self::insert_worker`] and
/// [`Self::cas_worker_status`] atomic: the former enforces the
/// one-active-worker-per-task invariant, the latter is the serialization
/// point for all status mutation.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Persists a new task.
    ///
    /// # Errors
    ///
    /// Returns [`tether_core::Error::Conflict`] if the task ID already
    /// exists.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Fetches a task by ID. Returns `None` if it does not exist.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Overwrites an existing task record.
    ///
    /// # Errors
    ///
    /// Returns [`tether_core::Error::ResourceNotFound`] if the task does
    /// not exist.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Persists a new worker, enforcing at most one active worker per
    /// task.
    ///
    /// # Errors
    ///
    /// Returns [`tether_core::Error::Conflict`] if an active worker for
    /// the same task already exists.
    async fn insert_worker(&self, worker: &WorkerInstance) -> Result<()>;

    /// Fetches a worker by ID. Returns `None` if it does not exist.
    async fn get_worker(&self, worker_id: WorkerId) -> Result<Option<WorkerInstance>>;

    /// Fetches the active worker for a task, if any.
    async fn active_worker_for_task(&self, task_id: TaskId) -> Result<Option<WorkerInstance>>;

    /// Atomically advances a worker's status from `expected` to `target`.
    ///
    /// The transition must be valid per
    /// [`WorkerStatus::can_transition_to`]; lifecycle timestamps are
    /// stamped on the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`tether_core::Error::InvalidStateTransition`] when
    /// `expected -> target` is not a legal edge. A status that merely
    /// does not match `expected` is not an error; it is reported as
    /// [`CasOutcome::StatusMismatch`].
    async fn cas_worker_status(
        &self,
        worker_id: WorkerId,
        expected: WorkerStatus,
        target: WorkerStatus,
    ) -> Result<CasOutcome>;

    /// Overwrites non-status fields of an existing worker record.
    ///
    /// Only the winner of a [`Self::cas_worker_status`] race may call
    /// this for terminal bookkeeping (final cost, output references), so
    /// plain overwrite semantics are safe.
    ///
    /// # Errors
    ///
    /// Returns [`tether_core::Error::ResourceNotFound`] if the worker
    /// does not exist.
    async fn update_worker(&self, worker: &WorkerInstance) -> Result<()>;

    /// Returns active workers whose persisted deadline has passed.
    async fn expired_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerInstance>>;

    /// Returns the number of workers currently in an active status.
    async fn count_active_workers(&self) -> Result<usize>;
}
