//! Pure admission algorithms.
//!
//! Both algorithms are plain functions of state, the current time and the
//! requested cost. They perform no I/O and hold no locks; callers that share
//! state between tasks must serialize access themselves.

use std::collections::VecDeque;

/// Token bucket state.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`.
/// Refill is computed lazily whenever the bucket is consumed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: f64,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    /// Try to take `cost` tokens at time `now`.
    ///
    /// Returns whether the request is admitted together with the next state.
    /// `last_refill` always advances to `now`, so a stream of rejected calls
    /// cannot starve the refill. A cost of zero is never admitted.
    pub fn consume(self, now: f64, cost: f64) -> (bool, Self) {
        let elapsed = (now - self.last_refill).max(0.0);
        let mut next = Self {
            tokens: (self.tokens + elapsed * self.refill_rate).min(self.capacity),
            last_refill: now.max(self.last_refill),
            ..self
        };

        if cost <= 0.0 || next.tokens < cost {
            return (false, next);
        }

        next.tokens = (next.tokens - cost).max(0.0);
        (true, next)
    }

    /// Tokens currently held, without applying pending refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Outcome of a sliding window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request was admitted (and recorded).
    pub admitted: bool,
    /// Seconds until a slot frees up; only set on rejection, always >= 1.
    pub retry_after: Option<u64>,
}

/// Sliding window log check.
///
/// Evicts every timestamp `<= now - window`, then admits iff fewer than
/// `limit` timestamps remain, recording `now` on admission. `timestamps`
/// must be kept in ascending order, which holds as long as callers feed
/// non-decreasing `now` values under the same lock.
pub fn sliding_window(
    timestamps: &mut VecDeque<f64>,
    now: f64,
    window: f64,
    limit: u32,
) -> WindowDecision {
    let cutoff = now - window;
    while timestamps.front().is_some_and(|&t| t <= cutoff) {
        timestamps.pop_front();
    }

    if (timestamps.len() as u64) < u64::from(limit) {
        // Keep the log sorted even if the caller's clock stepped backwards.
        let at = timestamps.back().map_or(now, |&last| last.max(now));
        timestamps.push_back(at);
        return WindowDecision {
            admitted: true,
            retry_after: None,
        };
    }

    let retry_after = match timestamps.front() {
        Some(&oldest) => retry_after_secs(oldest + window - now),
        None => retry_after_secs(window),
    };

    WindowDecision {
        admitted: false,
        retry_after: Some(retry_after),
    }
}

/// Round a wait up to whole seconds, never below one.
pub(crate) fn retry_after_secs(wait: f64) -> u64 {
    if wait.is_finite() && wait > 1.0 {
        wait.ceil() as u64
    } else {
        1
    }
}
