//! Deadline sweeper.
//!
//! In-process expiry timers die with the process; the persisted
//! `deadline_at` on each worker does not. The sweeper periodically scans
//! the store for active workers past their deadline and expires them
//! through the same compare-and-set path the timers use, so a sweep pass
//! and a late timer can race without double-applying.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tether_core::Result;

use crate::orchestrator::{ExpiryCause, WorkerOrchestrator};
use crate::store::FleetStore;

/// Summary of one sweep pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    /// Active workers found past their deadline.
    pub scanned: usize,
    /// Workers this pass transitioned out of an active state.
    pub expired: usize,
    /// Workers another path settled between the scan and the expiry.
    pub already_settled: usize,
    /// Expiry attempts that errored; they are retried next pass.
    pub failed: usize,
    /// When the pass ran.
    pub swept_at: DateTime<Utc>,
}

/// Scans for expired workers and settles them.
///
/// The sweeper reads the store directly but mutates only through the
/// orchestrator, the same as every other path.
#[derive(Clone)]
pub struct DeadlineSweeper {
    orchestrator: WorkerOrchestrator,
    store: Arc<dyn FleetStore>,
    interval: Duration,
}

impl DeadlineSweeper {
    /// Creates a sweeper over the given store.
    #[must_use]
    pub fn new(
        orchestrator: WorkerOrchestrator,
        store: Arc<dyn FleetStore>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            store,
            interval,
        }
    }

    /// Runs one sweep pass against the given clock reading.
    #[tracing::instrument(skip(self), fields(scanned = tracing::field::Empty))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let expired = self.store.expired_workers(now).await?;
        tracing::Span::current().record("scanned", expired.len());

        let mut summary = SweepSummary {
            scanned: expired.len(),
            expired: 0,
            already_settled: 0,
            failed: 0,
            swept_at: now,
        };

        for worker in expired {
            match self
                .orchestrator
                .expire_worker(worker.id, ExpiryCause::Sweep)
                .await
            {
                Ok(true) => summary.expired += 1,
                Ok(false) => summary.already_settled += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        worker_id = %worker.id,
                        error = %err,
                        "sweep failed to expire worker"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Runs the sweep loop until shutdown is signaled.
    ///
    /// The first tick fires immediately, which doubles as deadline
    /// recovery after a restart.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.interval, "deadline sweeper starting");

        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!("deadline sweeper shutting down");
                    break;
                }

                _ = ticks.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(summary) if summary.scanned > 0 => {
                            tracing::info!(
                                scanned = summary.scanned,
                                expired = summary.expired,
                                already_settled = summary.already_settled,
                                failed = summary.failed,
                                "sweep pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "sweep pass failed");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DeadlineSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineSweeper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
