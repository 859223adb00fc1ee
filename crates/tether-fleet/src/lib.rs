//! # tether-fleet
//!
//! Server-side orchestration layer for Tether: provisions one remote
//! worker per task, tracks both lifecycles in a durable store, and
//! reconciles asynchronous worker callbacks.
//!
//! The crate is built from these cooperating pieces:
//!
//! - [`task`] / [`worker`]: Lifecycle state machines and resource
//!   profile classification
//! - [`store`]: The [`FleetStore`] contract; every status change goes
//!   through its compare-and-set, so racing paths serialize there
//! - [`platform`]: The [`WorkerPlatform`] contract plus an HTTP provider
//!   client
//! - [`orchestrator`]: Provisioning, timeout timers, callback
//!   application, cancellation, teardown
//! - [`reconcile`]: Idempotent webhook handling for worker reports
//! - [`sweeper`]: Deadline recovery for timers lost to a restart
//! - [`http`]: The axum API surface
//!
//! ## Runtime Shape
//!
//! The service holds no per-task threads. Timers are spawned tasks that
//! re-derive their wait from the persisted `deadline_at`; a restart
//! drops them and the sweeper picks the deadlines back up. Any number
//! of callbacks, timers, and sweeps may race on one worker; exactly
//! one wins each status edge.
//!
//! ```text
//!  client ──POST /v1/tasks──▶ ┌──────────────┐     ┌──────────┐
//!                             │ orchestrator │────▶│ platform │ create/stop
//!  worker ──callback──▶       │  CAS store   │◀────│ provider │ delete/logs
//!  sweeper ──expire──▶        └──────────────┘     └──────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod platform;
pub mod reconcile;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod worker;

pub use config::FleetConfig;
pub use metrics::FleetMetrics;
pub use orchestrator::{ExpiryCause, ReportDisposition, WorkerOrchestrator, WorkerReport};
pub use platform::{CreateWorkerRequest, HttpWorkerPlatform, WorkerPlatform};
pub use reconcile::{
    CallbackResult, CallbackStatus, WorkerCallbackRequest, WorkerCallbackResponse,
};
pub use store::{CasOutcome, FleetStore, MemoryFleetStore};
pub use sweeper::{DeadlineSweeper, SweepSummary};
pub use task::{Task, TaskStatus};
pub use worker::{ResourceProfile, WorkerInstance, WorkerStatus};
