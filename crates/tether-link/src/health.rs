//! Connection health tracking from heartbeat round trips.
//!
//! The controller sends a `ping` on a fixed interval and feeds this
//! monitor two events: "ping sent" and "pong received". From those the
//! monitor derives:
//!
//! - Round-trip latency samples, kept in a fixed circular buffer so memory
//!   stays bounded no matter how long the connection lives
//! - A [`Quality`] classification recomputed from the most recent sample
//! - A consecutive-miss counter; a ping with no pong inside twice the
//!   heartbeat interval counts as missed
//!
//! Quality is reporting-only. Reconnection decisions key off
//! [`HealthMonitor::is_unhealthy`], which trips after three consecutive
//! misses, never off a slow-but-alive link.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Number of latency samples retained for the rolling average.
pub const SAMPLE_WINDOW: usize = 100;

/// Consecutive missed pongs after which the link is unhealthy.
pub const UNHEALTHY_MISS_THRESHOLD: u32 = 3;

/// Link quality derived from heartbeat latency.
///
/// Thresholds: below 50ms is `Excellent`, below 150ms `Good`, up to 500ms
/// `Poor`, and anything slower (or any outstanding miss) `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Round trips under 50ms.
    Excellent,
    /// Round trips under 150ms.
    Good,
    /// Round trips up to 500ms.
    Poor,
    /// Round trips over 500ms, or a missed pong.
    Critical,
}

impl Quality {
    /// Classifies a single round-trip latency.
    #[must_use]
    pub fn from_latency(latency: Duration) -> Self {
        let ms = latency.as_millis();
        if ms < 50 {
            Self::Excellent
        } else if ms < 150 {
            Self::Good
        } else if ms <= 500 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    /// Returns the lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    sent_at: Instant,
    deadline: Instant,
}

/// Heartbeat state machine.
///
/// Pure in-memory state driven by the controller's timer ticks; all time
/// comes in as arguments so tests control the clock.
#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    samples: [Duration; SAMPLE_WINDOW],
    sample_count: usize,
    cursor: usize,
    outstanding: Option<OutstandingPing>,
    consecutive_misses: u32,
    last_latency: Option<Duration>,
}

impl HealthMonitor {
    /// Creates a monitor for the given heartbeat interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            samples: [Duration::ZERO; SAMPLE_WINDOW],
            sample_count: 0,
            cursor: 0,
            outstanding: None,
            consecutive_misses: 0,
            last_latency: None,
        }
    }

    /// Records that a ping was sent.
    ///
    /// The pong deadline is twice the heartbeat interval from now. A ping
    /// sent while another is outstanding replaces it; the controller calls
    /// [`Self::check_deadline`] first, so the replaced ping has already
    /// been scored.
    pub fn record_ping_sent(&mut self, now: Instant) {
        self.outstanding = Some(OutstandingPing {
            sent_at: now,
            deadline: now + self.interval * 2,
        });
    }

    /// Records a pong and returns the measured round-trip latency.
    ///
    /// Resets the consecutive-miss counter. An unsolicited pong (no ping
    /// outstanding) is ignored and returns `None`.
    pub fn record_pong(&mut self, now: Instant) -> Option<Duration> {
        let ping = self.outstanding.take()?;
        let latency = now.saturating_duration_since(ping.sent_at);

        self.samples[self.cursor] = latency;
        self.cursor = (self.cursor + 1) % SAMPLE_WINDOW;
        self.sample_count = (self.sample_count + 1).min(SAMPLE_WINDOW);
        self.last_latency = Some(latency);
        self.consecutive_misses = 0;

        Some(latency)
    }

    /// Scores the outstanding ping against its deadline.
    ///
    /// Returns `true` when the ping is now counted as missed. The
    /// controller calls this on every heartbeat tick before sending the
    /// next ping.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        match self.outstanding {
            Some(ping) if now >= ping.deadline => {
                self.outstanding = None;
                self.consecutive_misses += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns true while a ping is awaiting its pong.
    #[must_use]
    pub const fn has_outstanding_ping(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Returns true when consecutive misses have reached the unhealthy
    /// threshold.
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.consecutive_misses >= UNHEALTHY_MISS_THRESHOLD
    }

    /// Returns the current quality classification.
    ///
    /// `None` until the first pong or miss. Any outstanding miss forces
    /// `Critical`, regardless of how fast the last round trip was.
    #[must_use]
    pub fn quality(&self) -> Option<Quality> {
        if self.consecutive_misses > 0 {
            return Some(Quality::Critical);
        }
        self.last_latency.map(Quality::from_latency)
    }

    /// Returns the most recent round-trip latency.
    #[must_use]
    pub const fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    /// Returns the rolling average over the sample window.
    #[must_use]
    pub fn average_latency(&self) -> Option<Duration> {
        if self.sample_count == 0 {
            return None;
        }
        let total: Duration = self.samples[..self.sample_count].iter().sum();
        u32::try_from(self.sample_count)
            .ok()
            .map(|count| total / count)
    }

    /// Returns the consecutive-miss counter.
    #[must_use]
    pub const fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Clears all heartbeat state.
    ///
    /// Called when a connection is (re)established; samples from a
    /// previous transport do not describe the new one.
    pub fn reset(&mut self) {
        self.samples = [Duration::ZERO; SAMPLE_WINDOW];
        self.sample_count = 0;
        self.cursor = 0;
        self.outstanding = None;
        self.consecutive_misses = 0;
        self.last_latency = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(15);

    #[test]
    fn quality_thresholds() {
        assert_eq!(Quality::from_latency(Duration::from_millis(10)), Quality::Excellent);
        assert_eq!(Quality::from_latency(Duration::from_millis(49)), Quality::Excellent);
        assert_eq!(Quality::from_latency(Duration::from_millis(50)), Quality::Good);
        assert_eq!(Quality::from_latency(Duration::from_millis(149)), Quality::Good);
        assert_eq!(Quality::from_latency(Duration::from_millis(150)), Quality::Poor);
        assert_eq!(Quality::from_latency(Duration::from_millis(500)), Quality::Poor);
        assert_eq!(Quality::from_latency(Duration::from_millis(501)), Quality::Critical);
    }

    #[test]
    fn pong_measures_latency() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let start = Instant::now();

        monitor.record_ping_sent(start);
        let latency = monitor.record_pong(start + Duration::from_millis(42));

        assert_eq!(latency, Some(Duration::from_millis(42)));
        assert_eq!(monitor.last_latency(), Some(Duration::from_millis(42)));
        assert_eq!(monitor.quality(), Some(Quality::Excellent));
    }

    #[test]
    fn unsolicited_pong_is_ignored() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        assert_eq!(monitor.record_pong(Instant::now()), None);
        assert_eq!(monitor.quality(), None);
    }

    #[test]
    fn miss_counts_after_twice_the_interval() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let start = Instant::now();
        monitor.record_ping_sent(start);

        // Just inside the window: not yet a miss.
        assert!(!monitor.check_deadline(start + INTERVAL * 2 - Duration::from_millis(1)));
        assert_eq!(monitor.consecutive_misses(), 0);

        // At the deadline the ping is scored as missed.
        assert!(monitor.check_deadline(start + INTERVAL * 2));
        assert_eq!(monitor.consecutive_misses(), 1);

        // The miss is consumed; a second check does not double-count.
        assert!(!monitor.check_deadline(start + INTERVAL * 3));
        assert_eq!(monitor.consecutive_misses(), 1);
    }

    #[test]
    fn three_consecutive_misses_are_unhealthy() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let mut now = Instant::now();

        for round in 1..=3 {
            monitor.record_ping_sent(now);
            now += INTERVAL * 2;
            assert!(monitor.check_deadline(now), "round {round} should miss");
        }

        assert_eq!(monitor.consecutive_misses(), 3);
        assert!(monitor.is_unhealthy());
        assert_eq!(monitor.quality(), Some(Quality::Critical));
    }

    #[test]
    fn pong_resets_the_miss_counter() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let mut now = Instant::now();

        for _ in 0..2 {
            monitor.record_ping_sent(now);
            now += INTERVAL * 2;
            assert!(monitor.check_deadline(now));
        }
        assert_eq!(monitor.consecutive_misses(), 2);

        monitor.record_ping_sent(now);
        monitor.record_pong(now + Duration::from_millis(30));

        assert_eq!(monitor.consecutive_misses(), 0);
        assert!(!monitor.is_unhealthy());
        assert_eq!(monitor.quality(), Some(Quality::Excellent));
    }

    #[test]
    fn miss_forces_critical_quality_despite_fast_last_sample() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let start = Instant::now();

        monitor.record_ping_sent(start);
        monitor.record_pong(start + Duration::from_millis(5));
        assert_eq!(monitor.quality(), Some(Quality::Excellent));

        monitor.record_ping_sent(start + INTERVAL);
        assert!(monitor.check_deadline(start + INTERVAL * 3));
        assert_eq!(monitor.quality(), Some(Quality::Critical));
    }

    #[test]
    fn rolling_average_is_bounded_by_the_window() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let mut now = Instant::now();

        // Fill the window with 10ms samples.
        for _ in 0..SAMPLE_WINDOW {
            monitor.record_ping_sent(now);
            now += Duration::from_millis(10);
            monitor.record_pong(now);
        }
        assert_eq!(monitor.average_latency(), Some(Duration::from_millis(10)));

        // Overwrite the whole window with 30ms samples; the old ones must
        // no longer contribute.
        for _ in 0..SAMPLE_WINDOW {
            monitor.record_ping_sent(now);
            now += Duration::from_millis(30);
            monitor.record_pong(now);
        }
        assert_eq!(monitor.average_latency(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn average_over_partial_window() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let mut now = Instant::now();

        for ms in [10u64, 20, 30] {
            monitor.record_ping_sent(now);
            now += Duration::from_millis(ms);
            monitor.record_pong(now);
        }

        assert_eq!(monitor.average_latency(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn reset_clears_everything() {
        let mut monitor = HealthMonitor::new(INTERVAL);
        let now = Instant::now();

        monitor.record_ping_sent(now);
        monitor.record_pong(now + Duration::from_millis(700));
        monitor.record_ping_sent(now + INTERVAL);
        monitor.check_deadline(now + INTERVAL * 4);
        assert_eq!(monitor.quality(), Some(Quality::Critical));

        monitor.reset();

        assert_eq!(monitor.quality(), None);
        assert_eq!(monitor.average_latency(), None);
        assert_eq!(monitor.consecutive_misses(), 0);
        assert!(!monitor.is_unhealthy());
    }
}
