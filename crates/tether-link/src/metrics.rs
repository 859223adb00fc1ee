//! Observability metrics for the connection link.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! the client-side dispatch layer. Metrics are designed to support:
//!
//! - **Alerting**: SLO-based alerts on drop rates and failover frequency
//! - **Dashboards**: Real-time visibility into queue depth and link health
//! - **Debugging**: Correlating connection churn with heartbeat latency
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tether_link_messages_enqueued_total` | Counter | `priority` | Messages accepted into the queue |
//! | `tether_link_messages_sent_total` | Counter | `priority`, `result` | Send attempts by outcome |
//! | `tether_link_messages_dropped_total` | Counter | `priority` | Messages dropped after retry exhaustion |
//! | `tether_link_queue_depth` | Gauge | `priority` | Messages waiting per priority bucket |
//! | `tether_link_state_transitions_total` | Counter | `from_state`, `to_state` | Connection state changes |
//! | `tether_link_failovers_total` | Counter | `reason` | Socket-to-polling failovers |
//! | `tether_link_reconnect_attempts_total` | Counter | - | Reconnection attempts |
//! | `tether_link_heartbeat_rtt_seconds` | Histogram | - | Ping round-trip time |
//! | `tether_link_heartbeat_misses_total` | Counter | - | Pongs that never arrived |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tether_core::Priority;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Messages accepted into the dispatch queue.
    pub const MESSAGES_ENQUEUED_TOTAL: &str = "tether_link_messages_enqueued_total";
    /// Counter: Send attempts by outcome.
    pub const MESSAGES_SENT_TOTAL: &str = "tether_link_messages_sent_total";
    /// Counter: Messages dropped after exhausting their attempt budget.
    pub const MESSAGES_DROPPED_TOTAL: &str = "tether_link_messages_dropped_total";
    /// Gauge: Messages waiting per priority bucket.
    pub const QUEUE_DEPTH: &str = "tether_link_queue_depth";
    /// Counter: Connection state transitions.
    pub const STATE_TRANSITIONS_TOTAL: &str = "tether_link_state_transitions_total";
    /// Counter: Socket-to-polling failovers.
    pub const FAILOVERS_TOTAL: &str = "tether_link_failovers_total";
    /// Counter: Reconnection attempts.
    pub const RECONNECT_ATTEMPTS_TOTAL: &str = "tether_link_reconnect_attempts_total";
    /// Histogram: Heartbeat round-trip time in seconds.
    pub const HEARTBEAT_RTT_SECONDS: &str = "tether_link_heartbeat_rtt_seconds";
    /// Counter: Heartbeat pongs that never arrived.
    pub const HEARTBEAT_MISSES_TOTAL: &str = "tether_link_heartbeat_misses_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Message priority (critical, high, normal, low).
    pub const PRIORITY: &str = "priority";
    /// Send result (delivered, failed).
    pub const RESULT: &str = "result";
    /// Previous connection state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target connection state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Failover reason (consecutive_failures, unhealthy, retries_exhausted).
    pub const REASON: &str = "reason";
}

/// High-level interface for recording link metrics.
///
/// Cheap to clone and share; all state lives in the global recorder.
#[derive(Debug, Clone, Default)]
pub struct LinkMetrics {
    _private: (),
}

impl LinkMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message accepted into the queue.
    pub fn record_enqueue(&self, priority: Priority) {
        counter!(
            names::MESSAGES_ENQUEUED_TOTAL,
            labels::PRIORITY => priority.as_label(),
        )
        .increment(1);
    }

    /// Records a send attempt outcome.
    pub fn record_send(&self, priority: Priority, delivered: bool) {
        let result = if delivered { "delivered" } else { "failed" };
        counter!(
            names::MESSAGES_SENT_TOTAL,
            labels::PRIORITY => priority.as_label(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a message dropped after retry exhaustion.
    pub fn record_drop(&self, priority: Priority) {
        counter!(
            names::MESSAGES_DROPPED_TOTAL,
            labels::PRIORITY => priority.as_label(),
        )
        .increment(1);
    }

    /// Sets the queue depth gauge for one priority bucket.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, priority: Priority, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::PRIORITY => priority.as_label(),
        )
        .set(depth as f64);
    }

    /// Records a connection state transition.
    pub fn record_state_transition(&self, from_state: &'static str, to_state: &'static str) {
        counter!(
            names::STATE_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state,
            labels::TO_STATE => to_state,
        )
        .increment(1);
    }

    /// Records a socket-to-polling failover.
    pub fn record_failover(&self, reason: &'static str) {
        counter!(
            names::FAILOVERS_TOTAL,
            labels::REASON => reason,
        )
        .increment(1);
    }

    /// Records a reconnection attempt.
    pub fn record_reconnect_attempt(&self) {
        counter!(names::RECONNECT_ATTEMPTS_TOTAL).increment(1);
    }

    /// Records a heartbeat round trip.
    pub fn observe_heartbeat_rtt(&self, rtt: Duration) {
        histogram!(names::HEARTBEAT_RTT_SECONDS).record(rtt.as_secs_f64());
    }

    /// Records a heartbeat pong that never arrived.
    pub fn record_heartbeat_miss(&self) {
        counter!(names::HEARTBEAT_MISSES_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_metrics_can_record_counters() {
        let metrics = LinkMetrics::new();

        // These calls should not panic even without a metrics recorder installed
        metrics.record_enqueue(Priority::Critical);
        metrics.record_send(Priority::Normal, true);
        metrics.record_send(Priority::Normal, false);
        metrics.record_drop(Priority::Low);
        metrics.record_failover("unhealthy");
        metrics.record_reconnect_attempt();
        metrics.record_heartbeat_miss();
    }

    #[test]
    fn link_metrics_can_set_gauges_and_histograms() {
        let metrics = LinkMetrics::new();

        metrics.set_queue_depth(Priority::High, 7);
        metrics.observe_heartbeat_rtt(Duration::from_millis(42));
        metrics.record_state_transition("DISCONNECTED", "CONNECTING_SOCKET");
    }
}
