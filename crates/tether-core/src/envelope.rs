//! Message and envelope types for the client-server channel.
//!
//! This module provides:
//!
//! - [`Priority`]: Four-level message priority with a total order
//! - [`Message`]: A queued unit of outbound communication with retry
//!   accounting
//! - [`Envelope`]: The transport-agnostic wire shape; both the socket and
//!   long-poll adapters serialize exactly this JSON
//!
//! ## Design Principles
//!
//! - **Transport agnostic**: The same envelope travels over either adapter
//! - **Immutable messages**: Only the `attempts` counter mutates after
//!   creation
//! - **Reserved types**: `ping`/`pong` envelopes carry heartbeat payloads
//!   and `auth`/`auth.ok`/`auth.rejected` frame the socket credential
//!   preamble; all are handled by the connection layer, never routed to
//!   subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::MessageId;

/// Number of priority levels, for fixed-size bucket arrays.
pub const PRIORITY_COUNT: usize = 4;

/// Reserved message type for heartbeat pings.
pub const TYPE_PING: &str = "ping";

/// Reserved message type for heartbeat pongs.
pub const TYPE_PONG: &str = "pong";

/// Reserved message type for the socket credential preamble.
pub const TYPE_AUTH: &str = "auth";

/// Reserved message type for a server accepting the credential preamble.
pub const TYPE_AUTH_OK: &str = "auth.ok";

/// Reserved message type for a server rejecting the credential preamble.
pub const TYPE_AUTH_REJECTED: &str = "auth.rejected";

/// Default number of delivery attempts before a message is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Message priority.
///
/// Higher priorities drain strictly before lower ones; within a priority,
/// delivery is FIFO. Heartbeat pings are emitted at [`Priority::High`] so
/// they are never starved by normal traffic but cannot starve
/// application-critical messages either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drains before everything else.
    Critical,
    /// Heartbeats and control traffic.
    High,
    /// Default for application messages.
    Normal,
    /// Background traffic; may be starved by continuous higher-priority load.
    Low,
}

impl Priority {
    /// All priorities in drain order (highest first).
    pub const ALL: [Self; PRIORITY_COUNT] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Returns the bucket index for this priority (0 = critical).
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Returns a lowercase label for metrics and logging.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A unit of outbound communication.
///
/// Created by the caller, enqueued by the scheduler, and drained to the
/// active transport. Never mutated after creation except `attempts`;
/// removed from the queue once acknowledged or after exhausting
/// `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier, assigned at creation.
    pub id: MessageId,
    /// String tag interpreted by the receiver.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: Priority,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
    /// Attempts after which the message is dropped and reported.
    pub max_attempts: u32,
}

impl Message {
    /// Creates a new message with a fresh ID and zero attempts.
    #[must_use]
    pub fn new(
        message_type: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            message_type: message_type.into(),
            payload,
            priority,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets a custom attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Records a failed delivery attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns true once the attempt budget is exhausted.
    #[must_use]
    pub const fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// The wire shape shared by both transport adapters.
///
/// Serialized as camelCase JSON: `{id, type, payload, priority, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message identifier (carried through from the queued message).
    pub id: MessageId,
    /// String tag interpreted by the receiver.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: Priority,
    /// When the envelope was put on the wire.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Builds the wire envelope for a queued message.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
            priority: message.priority,
            timestamp: Utc::now(),
        }
    }

    /// Builds a fresh envelope with a generated ID.
    #[must_use]
    pub fn new(
        message_type: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            message_type: message_type.into(),
            payload,
            priority,
            timestamp: Utc::now(),
        }
    }

    /// Returns true for reserved heartbeat envelopes.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.message_type == TYPE_PING || self.message_type == TYPE_PONG
    }

    /// Serializes the envelope to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes an envelope from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the input is not a valid envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Heartbeat payload carried by `ping` envelopes and echoed by `pong`.
///
/// The receiver of a pong computes the round trip as `now - sent_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    /// When the ping was emitted.
    pub sent_at: DateTime<Utc>,
}

impl PingPayload {
    /// Creates a payload stamped with the current time.
    #[must_use]
    pub fn now() -> Self {
        Self { sent_at: Utc::now() }
    }

    /// Encodes the payload as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_value(self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes the payload from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the value is not a heartbeat payload.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Credential payload carried by the socket `auth` preamble frame.
///
/// The socket adapter sends this as the first frame after connecting; the
/// server answers with an `auth.ok` or `auth.rejected` envelope before any
/// other traffic flows.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Bearer token presented to the server.
    pub token: String,
}

impl std::fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPayload")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl AuthPayload {
    /// Creates a payload carrying `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Encodes the payload as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_value(self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes the payload from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the value is not a credential payload.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_buckets() {
        assert_eq!(Priority::Critical.rank(), 0);
        assert_eq!(Priority::High.rank(), 1);
        assert_eq!(Priority::Normal.rank(), 2);
        assert_eq!(Priority::Low.rank(), 3);
    }

    #[test]
    fn priority_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Priority::Critical).unwrap(),
            "\"critical\""
        );
        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }

    #[test]
    fn priority_all_matches_rank_order() {
        for (index, priority) in Priority::ALL.iter().enumerate() {
            assert_eq!(priority.rank(), index);
        }
    }

    #[test]
    fn message_attempt_accounting() {
        let mut message = Message::new("task.submit", serde_json::json!({}), Priority::Normal);
        assert_eq!(message.attempts, 0);
        assert_eq!(message.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(!message.attempts_exhausted());

        message.record_attempt();
        message.record_attempt();
        assert!(!message.attempts_exhausted());
        message.record_attempt();
        assert!(message.attempts_exhausted());
    }

    #[test]
    fn message_custom_attempt_budget() {
        let mut message =
            Message::new("task.submit", serde_json::json!({}), Priority::Low).with_max_attempts(1);
        message.record_attempt();
        assert!(message.attempts_exhausted());
    }

    #[test]
    fn envelope_wire_shape() {
        let message = Message::new(
            "task.output",
            serde_json::json!({"line": "hello"}),
            Priority::Normal,
        );
        let envelope = Envelope::from_message(&message);
        let json = envelope.to_json().unwrap();

        assert!(json.contains("\"type\":\"task.output\""));
        assert!(json.contains("\"priority\":\"normal\""));
        assert!(json.contains("\"timestamp\""));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed.id, message.id);
        assert_eq!(parsed.message_type, "task.output");
    }

    #[test]
    fn envelope_rejects_malformed_json() {
        assert!(Envelope::from_json("{\"id\": 42}").is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn heartbeat_envelopes_are_reserved() {
        let ping = Envelope::new(TYPE_PING, serde_json::json!({}), Priority::High);
        let pong = Envelope::new(TYPE_PONG, serde_json::json!({}), Priority::High);
        let app = Envelope::new("task.output", serde_json::json!({}), Priority::Normal);
        assert!(ping.is_heartbeat());
        assert!(pong.is_heartbeat());
        assert!(!app.is_heartbeat());
    }

    #[test]
    fn ping_payload_roundtrip() {
        let payload = PingPayload::now();
        let value = payload.to_value().unwrap();
        assert!(value.get("sentAt").is_some());
        let parsed = PingPayload::from_value(&value).unwrap();
        assert_eq!(parsed.sent_at, payload.sent_at);
    }

    #[test]
    fn auth_payload_roundtrips_and_redacts_debug() {
        let payload = AuthPayload::new("bearer-abc123");
        assert!(!format!("{payload:?}").contains("bearer-abc123"));

        let value = payload.clone().to_value().unwrap();
        let parsed = AuthPayload::from_value(&value).unwrap();
        assert_eq!(parsed.token, "bearer-abc123");
    }
}
