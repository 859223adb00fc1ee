//! Configuration for the connection link.
//!
//! All knobs have production defaults; `validate` rejects values a
//! misconfigured deployment could use to starve the heartbeat or spin the
//! dispatch loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{BackoffPolicy, Error, Result};

use crate::queue::DEFAULT_RATE_PER_SEC;

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Lowest heartbeat interval accepted by validation.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Highest heartbeat interval accepted by validation.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Default interval between empty polls in polling mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default interval between dispatch ticks.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Default maximum messages drained per dispatch tick.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Connection link configuration.
///
/// ## Example
///
/// ```rust
/// use tether_link::LinkConfig;
///
/// let config = LinkConfig::new("127.0.0.1:7400", "http://127.0.0.1:7401/v1/poll");
/// config.validate().expect("defaults are valid");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Address of the socket transport endpoint (`host:port`).
    pub socket_addr: String,
    /// URL of the long-poll transport endpoint.
    pub polling_url: String,
    /// Interval between heartbeat pings. Valid range: 5s to 120s.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Token bucket refill rate in messages per second.
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,
    /// Maximum messages drained per dispatch tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Interval between dispatch ticks.
    #[serde(with = "humantime_serde", default = "default_dispatch_interval")]
    pub dispatch_interval: Duration,
    /// Interval between empty polls while in polling mode.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Socket reconnection backoff policy.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

const fn default_rate_per_sec() -> f64 {
    DEFAULT_RATE_PER_SEC
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_dispatch_interval() -> Duration {
    DEFAULT_DISPATCH_INTERVAL
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl LinkConfig {
    /// Creates a configuration with default tuning for the given endpoints.
    #[must_use]
    pub fn new(socket_addr: impl Into<String>, polling_url: impl Into<String>) -> Self {
        Self {
            socket_addr: socket_addr.into(),
            polling_url: polling_url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rate_per_sec: DEFAULT_RATE_PER_SEC,
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the token bucket refill rate.
    #[must_use]
    pub const fn with_rate_per_sec(mut self, rate: f64) -> Self {
        self.rate_per_sec = rate;
        self
    }

    /// Sets the per-tick drain batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the poll interval used in polling mode.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the dispatch tick interval.
    #[must_use]
    pub const fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Sets the reconnection backoff policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when any knob is outside its
    /// accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.socket_addr.is_empty() {
            return Err(Error::configuration("socket_addr must not be empty"));
        }
        if self.polling_url.is_empty() {
            return Err(Error::configuration("polling_url must not be empty"));
        }
        if self.heartbeat_interval < MIN_HEARTBEAT_INTERVAL
            || self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL
        {
            return Err(Error::configuration(format!(
                "heartbeat_interval must be between {}s and {}s, got {}s",
                MIN_HEARTBEAT_INTERVAL.as_secs(),
                MAX_HEARTBEAT_INTERVAL.as_secs(),
                self.heartbeat_interval.as_secs()
            )));
        }
        if self.rate_per_sec <= 0.0 || !self.rate_per_sec.is_finite() {
            return Err(Error::configuration(format!(
                "rate_per_sec must be a positive number, got {}",
                self.rate_per_sec
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::configuration("batch_size must be at least 1"));
        }
        if self.dispatch_interval.is_zero() {
            return Err(Error::configuration("dispatch_interval must be non-zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::configuration("poll_interval must be non-zero"));
        }
        if self.backoff.base_delay.is_zero() {
            return Err(Error::configuration("backoff.base_delay must be non-zero"));
        }
        if self.backoff.max_delay < self.backoff.base_delay {
            return Err(Error::configuration(
                "backoff.max_delay must be at least backoff.base_delay",
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(Error::configuration("backoff.max_attempts must be at least 1"));
        }
        Ok(())
    }
}
