//! Observability infrastructure for Tether.
//!
//! Structured logging with consistent spans: this module provides the
//! initialization helper every binary calls at startup, span constructors
//! so the link and fleet sides log the same field names, and the
//! [`TimingGuard`] both crates use to feed duration histograms.

use std::sync::Once;
use std::time::{Duration, Instant};

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tether_link=debug`)
///
/// # Example
///
/// ```rust
/// use tether_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for connection-link operations with standard fields.
///
/// # Example
///
/// ```rust
/// use tether_core::observability::link_span;
///
/// let span = link_span("drain_batch", "01HQ3M5S8D");
/// let _guard = span.enter();
/// // ... do link operation
/// ```
#[must_use]
pub fn link_span(operation: &str, session_id: &str) -> Span {
    tracing::info_span!(
        "link",
        op = operation,
        session_id = session_id,
    )
}

/// Creates a span for fleet orchestration operations.
///
/// # Example
///
/// ```rust
/// use tether_core::observability::fleet_span;
///
/// let span = fleet_span("request_worker", "01HQ3TASK", "01HQ3WORK");
/// let _guard = span.enter();
/// // ... do fleet operation
/// ```
#[must_use]
pub fn fleet_span(operation: &str, task_id: &str, worker_id: &str) -> Span {
    tracing::info_span!(
        "fleet",
        op = operation,
        task_id = task_id,
        worker_id = worker_id,
    )
}

/// RAII guard for timing operations.
///
/// Automatically reports the elapsed duration when dropped. The callback
/// decides where the duration goes, so this type stays metrics-agnostic.
///
/// ## Example
///
/// ```rust
/// use tether_core::observability::TimingGuard;
///
/// let mut elapsed = None;
/// {
///     let _guard = TimingGuard::new(|duration| {
///         elapsed = Some(duration);
///     });
///     // Do work...
/// } // Duration reported automatically on drop
/// assert!(elapsed.is_some());
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn test_link_span_creates_span() {
        let span = link_span("drain_batch", "session-1");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn test_fleet_span_creates_span() {
        let span = fleet_span("request_worker", "task-1", "worker-1");
        let _guard = span.enter();
        tracing::info!("fleet message");
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded_duration = None;

        {
            let _guard = TimingGuard::new(|d| {
                recorded_duration = Some(d);
            });
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(recorded_duration.is_some_and(|d| d >= Duration::from_millis(10)));
    }

    #[test]
    fn timing_guard_elapsed_works() {
        let guard = TimingGuard::new(|_| {});
        std::thread::sleep(Duration::from_millis(5));
        assert!(guard.elapsed() >= Duration::from_millis(5));
    }
}
