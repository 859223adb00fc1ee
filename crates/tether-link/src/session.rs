//! Connection state machine and observable session snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::SessionId;

use crate::health::Quality;

/// Connection controller state machine.
///
/// States follow a directed graph with a one-way failover edge:
/// ```text
/// ┌──────────────┐   connect()   ┌───────────────────┐  open ok   ┌──────────────────┐
/// │ DISCONNECTED │──────────────►│ CONNECTING_SOCKET │───────────►│ CONNECTED_SOCKET │
/// └──────────────┘               └───────────────────┘            └──────────────────┘
///        ▲                            │        ▲                          │
///        │                            │        └──────── close/error ─────┘
///        │                   failures ≥ 3, unhealthy,
///        │                   or retries exhausted
///        │                            │
///        │                            ▼
///        │                  ┌────────────────────┐  first poll ok  ┌───────────────────┐
///        │                  │ CONNECTING_POLLING │────────────────►│ CONNECTED_POLLING │
///        │                  └────────────────────┘                 └───────────────────┘
///        │                            │                                     │
///        └──────────── disconnect() ──┴─────────────────────────────────────┘
/// ```
///
/// Once failover moves the controller onto the polling edge it never walks
/// back to a socket state on its own; only an explicit `connect()` after a
/// `disconnect()` tries the socket again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// No transport active; queued messages are held.
    Disconnected,
    /// Socket open in progress (includes backoff waits between attempts).
    ConnectingSocket,
    /// Socket transport live.
    ConnectedSocket,
    /// Failover accepted; first poll not yet confirmed.
    ConnectingPolling,
    /// Polling transport live.
    ConnectedPolling,
}

impl LinkState {
    /// Returns true if a transport is live and batches may be dispatched.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::ConnectedSocket | Self::ConnectedPolling)
    }

    /// Returns true if the controller is on the socket edge of the graph.
    #[must_use]
    pub const fn is_socket(&self) -> bool {
        matches!(self, Self::ConnectingSocket | Self::ConnectedSocket)
    }

    /// Returns true if the controller has failed over to polling.
    #[must_use]
    pub const fn is_polling(&self) -> bool {
        matches!(self, Self::ConnectingPolling | Self::ConnectedPolling)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Disconnected => matches!(target, Self::ConnectingSocket),
            Self::ConnectingSocket => matches!(
                target,
                Self::ConnectedSocket | Self::ConnectingPolling | Self::Disconnected
            ),
            Self::ConnectedSocket => matches!(
                target,
                Self::ConnectingSocket | Self::ConnectingPolling | Self::Disconnected
            ),
            Self::ConnectingPolling => {
                matches!(target, Self::ConnectedPolling | Self::Disconnected)
            }
            Self::ConnectedPolling => matches!(target, Self::Disconnected),
        }
    }

    /// Returns the transport mode implied by this state.
    #[must_use]
    pub const fn mode(&self) -> TransportMode {
        match self {
            Self::Disconnected => TransportMode::Disconnected,
            Self::ConnectingSocket | Self::ConnectedSocket => TransportMode::Socket,
            Self::ConnectingPolling | Self::ConnectedPolling => TransportMode::Polling,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::ConnectingSocket => "connecting_socket",
            Self::ConnectedSocket => "connected_socket",
            Self::ConnectingPolling => "connecting_polling",
            Self::ConnectedPolling => "connected_polling",
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::ConnectingSocket => write!(f, "CONNECTING_SOCKET"),
            Self::ConnectedSocket => write!(f, "CONNECTED_SOCKET"),
            Self::ConnectingPolling => write!(f, "CONNECTING_POLLING"),
            Self::ConnectedPolling => write!(f, "CONNECTED_POLLING"),
        }
    }
}

/// Which adapter family the controller is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Persistent duplex socket.
    Socket,
    /// HTTP long-poll fallback.
    Polling,
    /// No transport active.
    Disconnected,
}

impl TransportMode {
    /// Returns the lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Polling => "polling",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Point-in-time snapshot of the link, safe to hand to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    /// Session identity; regenerated on every explicit `connect()`.
    pub id: SessionId,
    /// Current state machine position.
    pub state: LinkState,
    /// Transport mode implied by the state.
    pub mode: TransportMode,
    /// Consecutive socket failures since the last success.
    pub consecutive_failures: u32,
    /// Reconnect attempts made in the current connecting phase.
    pub reconnect_attempt: u32,
    /// Messages currently queued across all priorities.
    pub queue_depth: usize,
    /// Most recent heartbeat round trip, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    /// Rolling average heartbeat round trip, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<u64>,
    /// Current quality classification, if any samples exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    /// When the current transport connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_only_connects_to_socket() {
        let state = LinkState::Disconnected;
        assert!(state.can_transition_to(LinkState::ConnectingSocket));
        assert!(!state.can_transition_to(LinkState::ConnectedSocket));
        assert!(!state.can_transition_to(LinkState::ConnectingPolling));
        assert!(!state.can_transition_to(LinkState::ConnectedPolling));
    }

    #[test]
    fn socket_states_can_fail_over() {
        assert!(LinkState::ConnectingSocket.can_transition_to(LinkState::ConnectingPolling));
        assert!(LinkState::ConnectedSocket.can_transition_to(LinkState::ConnectingPolling));
    }

    #[test]
    fn polling_states_never_return_to_socket() {
        for state in [LinkState::ConnectingPolling, LinkState::ConnectedPolling] {
            assert!(!state.can_transition_to(LinkState::ConnectingSocket));
            assert!(!state.can_transition_to(LinkState::ConnectedSocket));
        }
    }

    #[test]
    fn every_state_can_disconnect_except_disconnected() {
        for state in [
            LinkState::ConnectingSocket,
            LinkState::ConnectedSocket,
            LinkState::ConnectingPolling,
            LinkState::ConnectedPolling,
        ] {
            assert!(state.can_transition_to(LinkState::Disconnected), "{state}");
        }
        assert!(!LinkState::Disconnected.can_transition_to(LinkState::Disconnected));
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&LinkState::ConnectingPolling).unwrap();
        assert_eq!(json, r#""CONNECTING_POLLING""#);

        let parsed: LinkState = serde_json::from_str(r#""CONNECTED_SOCKET""#).unwrap();
        assert_eq!(parsed, LinkState::ConnectedSocket);
    }

    #[test]
    fn mode_follows_state() {
        assert_eq!(LinkState::Disconnected.mode(), TransportMode::Disconnected);
        assert_eq!(LinkState::ConnectingSocket.mode(), TransportMode::Socket);
        assert_eq!(LinkState::ConnectedSocket.mode(), TransportMode::Socket);
        assert_eq!(LinkState::ConnectingPolling.mode(), TransportMode::Polling);
        assert_eq!(LinkState::ConnectedPolling.mode(), TransportMode::Polling);
    }

    #[test]
    fn connected_predicate() {
        assert!(LinkState::ConnectedSocket.is_connected());
        assert!(LinkState::ConnectedPolling.is_connected());
        assert!(!LinkState::ConnectingSocket.is_connected());
        assert!(!LinkState::Disconnected.is_connected());
    }

    #[test]
    fn session_snapshot_serializes_camel_case() {
        let session = ConnectionSession {
            id: SessionId::generate(),
            state: LinkState::Disconnected,
            mode: TransportMode::Disconnected,
            consecutive_failures: 0,
            reconnect_attempt: 0,
            queue_depth: 0,
            last_latency_ms: None,
            average_latency_ms: None,
            quality: None,
            connected_at: None,
        };
        let value = serde_json::to_value(&session).unwrap();

        assert_eq!(value["state"], "DISCONNECTED");
        assert_eq!(value["mode"], "disconnected");
        assert_eq!(value["consecutiveFailures"], 0);
        assert!(value.get("lastLatencyMs").is_none());
    }
}
