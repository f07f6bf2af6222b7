//! In-process implementation of [`WindowStore`].
//!
//! Every admission runs under one store-wide lock, which gives the same
//! all-or-nothing behaviour as a scripted transaction on a single-threaded
//! server. Used by tests and for fault injection (unavailability and added
//! latency).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::algorithm::sliding_window;
use super::store::{StoreError, StoreVerdict, WindowRequest, WindowStore};
use super::unix_now;

type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Default)]
struct StoredWindow {
    scores: VecDeque<f64>,
    expires_at: f64,
}

/// A shared-store stand-in living in process memory.
pub struct MemoryStore {
    windows: Mutex<HashMap<String, StoredWindow>>,
    clock: Clock,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.windows.lock().len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .field("latency", &*self.latency.lock())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(unix_now)
    }

    /// Create a store driven by a custom clock (seconds since the epoch).
    pub fn with_clock<C>(clock: C) -> Self
    where
        C: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock: Arc::new(clock),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it reaches the store.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Members currently stored under `key`, ignoring expiry.
    pub fn member_count(&self, key: &str) -> usize {
        self.windows
            .lock()
            .get(key)
            .map_or(0, |window| window.scores.len())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn admit(&self, request: &WindowRequest) -> Result<StoreVerdict, StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }

        let now = (self.clock)();
        let window = request.window.as_secs_f64();
        let mut windows = self.windows.lock();

        if windows
            .get(&request.key)
            .is_some_and(|stored| stored.expires_at <= now)
        {
            windows.remove(&request.key);
        }

        let stored = windows.entry(request.key.clone()).or_default();
        let decision = sliding_window(&mut stored.scores, now, window, request.limit);
        if decision.admitted {
            stored.expires_at = now + window;
        } else if stored.scores.is_empty() {
            windows.remove(&request.key);
        }

        trace!(
            key = %request.key,
            admitted = decision.admitted,
            "Memory store admission"
        );

        Ok(StoreVerdict {
            admitted: decision.admitted,
            retry_after: decision.retry_after,
            now,
        })
    }
}
