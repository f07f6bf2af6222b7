//! In-process sliding window limiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::algorithm::{sliding_window, WindowDecision};
use super::unix_now;

/// Sliding window state for a single limiting key.
#[derive(Debug, Default)]
struct WindowState {
    /// Admitted request timestamps, oldest first.
    timestamps: VecDeque<f64>,
    /// Window length used by the most recent check.
    window: f64,
    /// Time of the most recent check.
    last_seen: f64,
    /// Set by the sweeper once the entry has been removed from the map.
    evicted: bool,
}

/// A per-process rate limiter keyed by limiting key.
///
/// Every key gets its own mutex, so contention is confined to callers that
/// share a key. The outer map is only locked long enough to fetch or create
/// the entry.
#[derive(Debug, Default)]
pub struct LocalLimiter {
    windows: DashMap<String, Arc<Mutex<WindowState>>>,
}

impl LocalLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a request for `key`.
    pub fn is_allowed(&self, key: &str, limit: u32, window: Duration, now: f64) -> WindowDecision {
        let window_secs = window.as_secs_f64();

        loop {
            let entry = self.entry(key);
            let mut state = entry.lock();

            // The sweeper removed this entry between our lookup and the lock.
            if state.evicted {
                continue;
            }

            state.window = window_secs;
            state.last_seen = state.last_seen.max(now);
            let decision = sliding_window(&mut state.timestamps, now, window_secs, limit);

            trace!(
                key = %key,
                limit = limit,
                count = state.timestamps.len(),
                admitted = decision.admitted,
                "Local window checked"
            );

            return decision;
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<WindowState>> {
        if let Some(entry) = self.windows.get(key) {
            return entry.value().clone();
        }

        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, "Creating local window");
                Arc::new(Mutex::new(WindowState::default()))
            })
            .value()
            .clone()
    }

    /// Remove keys idle for more than twice their window.
    ///
    /// Entries whose lock is currently held are left for the next sweep.
    /// Returns the number of removed keys.
    pub fn sweep(&self, now: f64) -> usize {
        let mut removed = 0;

        self.windows.retain(|_, entry| match entry.try_lock() {
            Some(mut state) => {
                let idle = now - state.last_seen > 2.0 * state.window;
                if idle {
                    state.evicted = true;
                    removed += 1;
                }
                !idle
            }
            None => true,
        });

        removed
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Number of requests recorded for `key` in its current log.
    pub fn recorded(&self, key: &str) -> Option<usize> {
        self.windows
            .get(key)
            .map(|entry| entry.value().lock().timestamps.len())
    }

    /// Run the idle sweep every `interval` until `shutdown` resolves.
    pub async fn run_sweeper<F>(self: Arc<Self>, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Local limiter sweeper started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let removed = self.sweep(unix_now());
                    if removed > 0 {
                        debug!(removed = removed, remaining = self.key_count(), "Swept idle keys");
                    }
                }
            }
        }

        info!("Local limiter sweeper stopped");
    }
}
