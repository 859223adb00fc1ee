//! # tether-core
//!
//! Core abstractions for the Tether real-time dispatch and worker
//! orchestration layer.
//!
//! This crate provides the foundational types used by both sides of the
//! channel:
//!
//! - **Identifiers**: Strongly-typed ULID-backed IDs for messages, sessions,
//!   tasks, and workers
//! - **Envelope**: The transport-agnostic wire shape shared by the socket
//!   and long-poll adapters
//! - **Backoff**: The exponential reconnect policy with bounded jitter
//! - **Auth**: The bearer-token seam shared by all outbound HTTP
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap used by every binary
//!
//! ## Crate Boundary
//!
//! `tether-core` is the only crate allowed to define shared primitives.
//! It performs no I/O; the client (`tether-link`) and server
//! (`tether-fleet`) crates build on these contracts.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::{Envelope, Message, MessageId, Priority};
//!
//! let message = Message::new("task.submit", serde_json::json!({"command": "ls"}), Priority::Normal);
//! let envelope = Envelope::from_message(&message);
//! assert_eq!(envelope.priority, Priority::Normal);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod backoff;
pub mod envelope;
pub mod error;
pub mod id;
pub mod observability;

// Re-export key types at crate root for ergonomics
pub use auth::{AuthProvider, StaticTokenProvider};
pub use backoff::BackoffPolicy;
pub use envelope::{AuthPayload, Envelope, Message, PingPayload, Priority, PRIORITY_COUNT};
pub use error::{Error, Result};
pub use id::{MessageId, SessionId, SubscriptionId, TaskId, WorkerId};
pub use observability::{init_logging, LogFormat, TimingGuard};
