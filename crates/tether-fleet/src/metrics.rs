//! Observability metrics for the fleet layer.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! worker orchestration. Metrics are designed to support:
//!
//! - **Alerting**: SLO-based alerts on provisioning failures and timeouts
//! - **Dashboards**: Real-time visibility into the active fleet and spend
//! - **Debugging**: Correlating callback outcomes with worker churn
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tether_fleet_workers_provisioned_total` | Counter | `profile` | Workers that reached PROVISIONING |
//! | `tether_fleet_workers_terminated_total` | Counter | - | Workers torn down |
//! | `tether_fleet_provisioning_failures_total` | Counter | `profile` | Provider create rejections |
//! | `tether_fleet_callbacks_total` | Counter | `outcome` | Worker callbacks by outcome |
//! | `tether_fleet_callback_duration_seconds` | Histogram | - | Callback handling latency |
//! | `tether_fleet_timeouts_total` | Counter | - | Workers expired by the timeout timer |
//! | `tether_fleet_sweep_expired_total` | Counter | - | Workers expired by the sweeper |
//! | `tether_fleet_active_workers` | Gauge | - | Workers currently in an active status |
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

use crate::worker::ResourceProfile;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Workers that reached PROVISIONING on the provider.
    pub const WORKERS_PROVISIONED_TOTAL: &str = "tether_fleet_workers_provisioned_total";
    /// Counter: Workers torn down on the provider.
    pub const WORKERS_TERMINATED_TOTAL: &str = "tether_fleet_workers_terminated_total";
    /// Counter: Provider rejections during worker creation.
    pub const PROVISIONING_FAILURES_TOTAL: &str = "tether_fleet_provisioning_failures_total";
    /// Counter: Worker callbacks by outcome.
    pub const CALLBACKS_TOTAL: &str = "tether_fleet_callbacks_total";
    /// Histogram: Callback handling latency in seconds.
    pub const CALLBACK_DURATION_SECONDS: &str = "tether_fleet_callback_duration_seconds";
    /// Counter: Workers expired by the in-process timeout timer.
    pub const TIMEOUTS_TOTAL: &str = "tether_fleet_timeouts_total";
    /// Counter: Workers expired by the deadline sweeper.
    pub const SWEEP_EXPIRED_TOTAL: &str = "tether_fleet_sweep_expired_total";
    /// Gauge: Workers currently in an active status.
    pub const ACTIVE_WORKERS: &str = "tether_fleet_active_workers";
}

/// Label keys used across metrics.
pub mod labels {
    /// Resource profile (minimal, build, gpu).
    pub const PROFILE: &str = "profile";
    /// Callback outcome (acknowledged, duplicate, bad_request, not_found, error).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording fleet metrics.
///
/// Cheap to clone and share; all state lives in the global recorder.
#[derive(Debug, Clone, Default)]
pub struct FleetMetrics {
    _private: (),
}

impl FleetMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a worker handed to the provider.
    pub fn record_provisioned(&self, profile: ResourceProfile) {
        counter!(
            names::WORKERS_PROVISIONED_TOTAL,
            labels::PROFILE => profile.as_label(),
        )
        .increment(1);
    }

    /// Records a worker torn down.
    pub fn record_terminated(&self) {
        counter!(names::WORKERS_TERMINATED_TOTAL).increment(1);
    }

    /// Records a provider create rejection.
    pub fn record_provisioning_failure(&self, profile: ResourceProfile) {
        counter!(
            names::PROVISIONING_FAILURES_TOTAL,
            labels::PROFILE => profile.as_label(),
        )
        .increment(1);
    }

    /// Records a worker callback outcome.
    pub fn record_callback(&self, outcome: &'static str) {
        counter!(
            names::CALLBACKS_TOTAL,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records how long a callback took to handle.
    pub fn observe_callback_duration(&self, elapsed: Duration) {
        histogram!(names::CALLBACK_DURATION_SECONDS).record(elapsed.as_secs_f64());
    }

    /// Records a worker expired by the in-process timeout timer.
    pub fn record_timeout(&self) {
        counter!(names::TIMEOUTS_TOTAL).increment(1);
    }

    /// Records a worker expired by the deadline sweeper.
    pub fn record_sweep_expired(&self) {
        counter!(names::SWEEP_EXPIRED_TOTAL).increment(1);
    }

    /// Sets the active-worker gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_active_workers(&self, count: usize) {
        gauge!(names::ACTIVE_WORKERS).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_metrics_can_record_counters() {
        let metrics = FleetMetrics::new();

        // These calls should not panic even without a metrics recorder installed
        metrics.record_provisioned(ResourceProfile::Gpu);
        metrics.record_terminated();
        metrics.record_provisioning_failure(ResourceProfile::Build);
        metrics.record_callback("acknowledged");
        metrics.record_timeout();
        metrics.record_sweep_expired();
    }

    #[test]
    fn fleet_metrics_can_set_gauges_and_histograms() {
        let metrics = FleetMetrics::new();

        metrics.set_active_workers(3);
        metrics.observe_callback_duration(Duration::from_millis(12));
    }
}
