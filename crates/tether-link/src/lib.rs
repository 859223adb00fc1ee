//! # tether-link
//!
//! Client-side connection layer for Tether: a reliable, reconnecting,
//! priority-aware message channel that survives transport failures.
//!
//! The crate is built from four cooperating pieces:
//!
//! - [`queue`]: In-memory priority queue with token-bucket rate limiting
//! - [`health`]: Heartbeat latency tracking and quality classification
//! - [`transport`]: Two interchangeable adapters, a persistent socket and
//!   an HTTP long-poll fallback, behind one contract
//! - [`controller`]: The connection state machine that owns transport
//!   selection, reconnection backoff, and failover
//!
//! ## Runtime Shape
//!
//! All mutable state lives inside a single spawned actor task; callers
//! interact through a cheap-to-clone [`controller::LinkHandle`]. No two
//! scheduling ticks ever run concurrently, so the layer is reentrancy-safe
//! by construction rather than by locking.
//!
//! ```text
//!  caller ──publish──▶ LinkHandle ──mpsc──▶ ┌────────────────────┐
//!  caller ──subscribe─▶                     │  controller actor   │──▶ transport
//!                                           │  queue | health |  │◀── inbound
//!                                           │  backoff | routing │
//!                                           └────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod session;
pub mod transport;

pub use config::LinkConfig;
pub use controller::{ConnectionController, LinkHandle};
pub use health::{HealthMonitor, Quality};
pub use queue::{DispatchQueue, DroppedMessage, RequeueOutcome, TokenBucket};
pub use session::{ConnectionSession, LinkState, TransportMode};
pub use transport::{PollingTransport, SocketTransport, Transport};
