//! Configuration for the fleet layer.
//!
//! All knobs except the callback base URL have production defaults;
//! `validate` rejects values that would disable the timeout safety net.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{Error, Result};

use crate::task::DEFAULT_TIMEOUT_SECONDS;

/// Default interval between deadline sweep passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Fleet orchestration configuration.
///
/// ## Example
///
/// ```rust
/// use tether_fleet::FleetConfig;
///
/// let config = FleetConfig::new("http://fleet.internal:7500");
/// config.validate().expect("defaults are valid");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Public base URL of this service, used to build worker callback
    /// URLs (`{base}/v1/workers/{worker_id}/callback`).
    pub callback_base_url: String,
    /// Execution budget applied to tasks that do not specify one.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u32,
    /// Interval between deadline sweep passes.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

const fn default_timeout_seconds() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

impl FleetConfig {
    /// Creates a configuration with default tuning for the given callback
    /// base URL.
    #[must_use]
    pub fn new(callback_base_url: impl Into<String>) -> Self {
        Self {
            callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Sets the default task execution budget.
    #[must_use]
    pub const fn with_default_timeout_seconds(mut self, seconds: u32) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    /// Sets the deadline sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The callback URL a given worker reports its outcome to.
    #[must_use]
    pub fn callback_url(&self, worker_id: tether_core::WorkerId) -> String {
        format!("{}/v1/workers/{worker_id}/callback", self.callback_base_url)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when any knob is outside its
    /// accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.callback_base_url.is_empty() {
            return Err(Error::configuration("callback_base_url must not be empty"));
        }
        if self.default_timeout_seconds == 0 {
            return Err(Error::configuration(
                "default_timeout_seconds must be at least 1",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::configuration("sweep_interval must be non-zero"));
        }
        Ok(())
    }
}
