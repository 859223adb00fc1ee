//! Exponential reconnect backoff with bounded jitter.
//!
//! The connection controller retries a failed transport with
//! `min(base × 2^(attempt-1), max_delay)` plus a jitter of up to 25% of
//! the clamped delay, and gives up (forcing failover) after a fixed
//! attempt cap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay for the first reconnect attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default upper bound on the exponential delay before jitter.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default attempt cap before reconnection is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnect backoff policy.
///
/// # Example
///
/// ```rust
/// use tether_core::backoff::BackoffPolicy;
///
/// let policy = BackoffPolicy::default();
/// let first = policy.delay_for(1);
/// let second = policy.delay_for(2);
/// assert!(second >= first);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Clamp applied to the exponential term before jitter.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Attempts after which the caller should stop retrying.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with explicit parameters.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Returns the deterministic delay for an attempt, without jitter.
    ///
    /// Attempts are 1-indexed; attempt 0 is treated as 1. The exponential
    /// term saturates instead of overflowing and is clamped to `max_delay`.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let multiplier = 1u64 << exp;
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let raw = base_ms.saturating_mul(multiplier);
        Duration::from_millis(raw.min(max_ms))
    }

    /// Returns the delay for an attempt with jitter applied.
    ///
    /// The jitter is uniform-ish in `[0, 0.25 × delay]` on top of
    /// [`Self::base_delay_for`], so repeated reconnects across clients do
    /// not synchronize.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let clamped = self.base_delay_for(attempt);
        let clamped_ms = u64::try_from(clamped.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = clamped_ms.saturating_mul(jitter_seed() % 1000) / 4000;
        Duration::from_millis(clamped_ms.saturating_add(jitter_ms))
    }

    /// Returns true once the attempt cap is reached.
    #[must_use]
    pub const fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Generates a jitter seed in `[0, u64::MAX]`.
fn jitter_seed() -> u64 {
    // Simple linear congruential generator seeded from the clock
    // (avoids full rand dependency for this simple case)
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed.wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407)
}
