//! In-memory fleet store for testing and single-process deployments.
//!
//! ## Limitations
//!
//! - **No persistence**: State is lost on restart; the persisted-deadline
//!   recovery path in the sweeper only matters with a durable backend.
//! - **Single-process only**: Records are not visible across process
//!   boundaries.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tether_core::{Error, Result, TaskId, WorkerId};

use super::{CasOutcome, FleetStore};
use crate::task::Task;
use crate::worker::{WorkerInstance, WorkerStatus};

/// Internal store state protected by a single lock.
#[derive(Debug, Default)]
struct FleetState {
    tasks: HashMap<TaskId, Task>,
    workers: HashMap<WorkerId, WorkerInstance>,
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("fleet store lock poisoned")
}

/// Thread-safe in-memory implementation of [`FleetStore`].
///
/// Atomicity for [`FleetStore::insert_worker`] and
/// [`FleetStore::cas_worker_status`] falls out of the single write lock.
///
/// ## Example
///
/// ```rust
/// use tether_fleet::store::MemoryFleetStore;
///
/// let store = MemoryFleetStore::new();
/// // Insert tasks and workers in tests...
/// ```
#[derive(Debug, Default)]
pub struct MemoryFleetStore {
    state: RwLock<FleetState>,
}

impl MemoryFleetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FleetStore for MemoryFleetStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.tasks.contains_key(&task.id) {
            return Err(Error::conflict(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.tasks.contains_key(&task.id) {
            return Err(Error::resource_not_found("task", task.id));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn insert_worker(&self, worker: &WorkerInstance) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let active = state
            .workers
            .values()
            .find(|w| w.task_id == worker.task_id && w.status.is_active());
        if let Some(existing) = active {
            return Err(Error::conflict(format!(
                "task {} already has active worker {}",
                worker.task_id, existing.id
            )));
        }
        state.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, worker_id: WorkerId) -> Result<Option<WorkerInstance>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.workers.get(&worker_id).cloned())
    }

    async fn active_worker_for_task(&self, task_id: TaskId) -> Result<Option<WorkerInstance>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .workers
            .values()
            .find(|w| w.task_id == task_id && w.status.is_active())
            .cloned())
    }

    async fn cas_worker_status(
        &self,
        worker_id: WorkerId,
        expected: WorkerStatus,
        target: WorkerStatus,
    ) -> Result<CasOutcome> {
        if !expected.can_transition_to(target) {
            return Err(Error::invalid_transition(
                expected.to_string(),
                target.to_string(),
                "not a valid worker lifecycle edge",
            ));
        }
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            return Ok(CasOutcome::NotFound);
        };
        if worker.status != expected {
            return Ok(CasOutcome::StatusMismatch {
                actual: worker.status,
            });
        }
        worker.apply_status(target);
        Ok(CasOutcome::Updated(worker.clone()))
    }

    async fn update_worker(&self, worker: &WorkerInstance) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.workers.contains_key(&worker.id) {
            return Err(Error::resource_not_found("worker", worker.id));
        }
        state.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn expired_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerInstance>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .workers
            .values()
            .filter(|w| w.status.is_active() && w.deadline_at <= now)
            .cloned()
            .collect())
    }

    async fn count_active_workers(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.workers.values().filter(|w| w.status.is_active()).count())
    }
}
