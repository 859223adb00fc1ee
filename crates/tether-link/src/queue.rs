//! Priority-ordered, rate-limited outbound message queue.
//!
//! This module provides:
//!
//! - [`DispatchQueue`]: Four FIFO buckets drained strictly in priority order
//! - [`TokenBucket`]: Refill-on-read rate limiter (default 50 messages/s)
//! - [`RequeueOutcome`]: Head re-enqueue vs. drop decision for failed sends
//!
//! ## Design Principles
//!
//! - **Single owner**: The queue lives inside the controller actor, so no
//!   locking; draining is a pure function of (state, now)
//! - **No deduplication**: Callers own idempotency at the message-type level
//! - **No silent loss**: A message that exhausts its attempt budget is
//!   returned as a [`DroppedMessage`] exactly once

use std::collections::VecDeque;
use std::time::Instant;

use tether_core::{Message, MessageId, Priority, PRIORITY_COUNT};

/// Default token refill rate (messages per second).
pub const DEFAULT_RATE_PER_SEC: f64 = 50.0;

/// Token-bucket rate limiter.
///
/// Tokens refill continuously at `rate_per_sec` up to `capacity` (one
/// second of burst by default) and are consumed one per drained message.
/// Refill is computed from an injected [`Instant`] so drain results are a
/// deterministic function of elapsed time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket with the given refill rate and one second of burst
    /// capacity, starting full.
    #[must_use]
    pub fn new(rate_per_sec: f64, now: Instant) -> Self {
        Self::with_capacity(rate_per_sec, rate_per_sec, now)
    }

    /// Creates a bucket with explicit capacity, starting full.
    #[must_use]
    pub fn with_capacity(rate_per_sec: f64, capacity: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec: rate_per_sec.max(0.0),
            last_refill: now,
        }
    }

    /// Refills the bucket for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns the number of whole tokens available after refilling.
    #[must_use]
    pub fn available(&mut self, now: Instant) -> usize {
        self.refill(now);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            self.tokens.floor().max(0.0) as usize
        }
    }

    /// Consumes `count` tokens. Callers must have checked availability.
    pub fn consume(&mut self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        {
            self.tokens = (self.tokens - count as f64).max(0.0);
        }
    }

    /// Returns `count` tokens to the bucket, up to capacity.
    ///
    /// Used when drained messages are put back without a delivery attempt.
    pub fn refund(&mut self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        {
            self.tokens = (self.tokens + count as f64).min(self.capacity);
        }
    }
}

/// A message dropped after exhausting its attempt budget.
///
/// Reported to the caller exactly once; the message is no longer queued.
#[derive(Debug, Clone)]
pub struct DroppedMessage {
    /// The dropped message, attempts counter included.
    pub message: Message,
    /// Human-readable reason for the drop.
    pub reason: String,
}

/// Outcome of re-enqueueing a message after a failed send.
#[derive(Debug)]
pub enum RequeueOutcome {
    /// The message went back to the head of its priority bucket.
    Requeued,
    /// The attempt budget is exhausted; the message was dropped.
    Dropped(DroppedMessage),
}

impl RequeueOutcome {
    /// Returns true when the message was requeued for another attempt.
    #[must_use]
    pub const fn is_requeued(&self) -> bool {
        matches!(self, Self::Requeued)
    }
}

/// In-memory priority queue with token-bucket rate limiting.
///
/// ## Ordering Guarantee
///
/// `drain_batch` pops strictly in priority order (the critical bucket is
/// fully drained before high, and so on) and FIFO within a bucket. A
/// burst of low messages can therefore be delayed arbitrarily by
/// continuous critical traffic; that is the intended tradeoff, not a bug.
#[derive(Debug)]
pub struct DispatchQueue {
    buckets: [VecDeque<Message>; PRIORITY_COUNT],
    limiter: TokenBucket,
}

impl DispatchQueue {
    /// Creates a queue with the given token refill rate.
    #[must_use]
    pub fn new(rate_per_sec: f64, now: Instant) -> Self {
        Self {
            buckets: Default::default(),
            limiter: TokenBucket::new(rate_per_sec, now),
        }
    }

    /// Creates a queue with an explicit burst capacity.
    #[must_use]
    pub fn with_burst(rate_per_sec: f64, capacity: f64, now: Instant) -> Self {
        Self {
            buckets: Default::default(),
            limiter: TokenBucket::with_capacity(rate_per_sec, capacity, now),
        }
    }

    /// Appends a message to the bucket for its priority.
    ///
    /// Non-blocking; returns the message ID immediately. No deduplication
    /// is performed.
    pub fn enqueue(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.buckets[message.priority.rank()].push_back(message);
        id
    }

    /// Pops up to `max_count` messages across buckets in strict priority
    /// order, consuming one rate token per message returned.
    ///
    /// Returns an empty batch when the queue is empty or the bucket has no
    /// whole tokens; when fewer tokens than `max_count` are available the
    /// batch is truncated to the token count.
    pub fn drain_batch(&mut self, max_count: usize, now: Instant) -> Vec<Message> {
        let allowance = self.limiter.available(now).min(max_count);
        if allowance == 0 {
            return Vec::new();
        }

        let mut batch = Vec::with_capacity(allowance);
        for bucket in &mut self.buckets {
            while batch.len() < allowance {
                match bucket.pop_front() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            if batch.len() == allowance {
                break;
            }
        }

        self.limiter.consume(batch.len());
        batch
    }

    /// Puts a drained-but-unattempted message back at the head of its
    /// priority bucket and refunds its token.
    ///
    /// Used for the tail of a batch cut short by a transport failure; the
    /// failed message itself goes through [`Self::requeue_front`] instead.
    pub fn restore_front(&mut self, message: Message) {
        self.buckets[message.priority.rank()].push_front(message);
        self.limiter.refund(1);
    }

    /// Puts a failed send back at the head of its original priority bucket
    /// with the attempt counter incremented, or drops it once the budget is
    /// exhausted.
    pub fn requeue_front(&mut self, mut message: Message) -> RequeueOutcome {
        message.record_attempt();
        if message.attempts_exhausted() {
            let reason = format!(
                "delivery failed after {} attempts",
                message.attempts
            );
            return RequeueOutcome::Dropped(DroppedMessage { message, reason });
        }
        self.buckets[message.priority.rank()].push_front(message);
        RequeueOutcome::Requeued
    }

    /// Returns the total number of queued messages.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Returns the number of queued messages at one priority.
    #[must_use]
    pub fn depth_for(&self, priority: Priority) -> usize {
        self.buckets[priority.rank()].len()
    }

    /// Returns true when no messages are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }
}
