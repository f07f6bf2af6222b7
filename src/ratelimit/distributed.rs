//! Distributed rate limiter backed by a shared [`WindowStore`].
//!
//! Each check makes exactly one bounded attempt at the store. When the store
//! is unreachable, errors, or misses the deadline, the same check is answered
//! by the process-local [`LocalLimiter`]. During an outage limits are
//! therefore enforced per process rather than globally; requests are never
//! waved through unconditionally and never rejected just because the store
//! is down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::algorithm::TokenBucket;
use super::local::LocalLimiter;
use super::store::{FailureClass, StoreError, StoreVerdict, WindowRequest, WindowStore};
use super::unix_now;

/// Default per-call store budget.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default minimum spacing between store failure log lines per class.
pub const DEFAULT_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(10);
/// Default cap on store calls running at once, including timed-out ones
/// that have not finished yet.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Where an admission decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Store,
    Local,
}

/// Outcome of [`DistributedLimiter::is_allowed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub admitted: bool,
    /// Seconds until a slot frees up; set on rejection, always >= 1.
    pub retry_after: Option<u64>,
    /// Clock used for the decision: the store's when it answered, else the
    /// caller's.
    pub now: f64,
    pub source: DecisionSource,
}

/// Snapshot of the limiter's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub store_admitted: u64,
    pub store_denied: u64,
    pub local_decisions: u64,
    pub store_unavailable: u64,
    pub store_timeouts: u64,
    pub store_overloaded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    store_admitted: AtomicU64,
    store_denied: AtomicU64,
    local_decisions: AtomicU64,
    store_unavailable: AtomicU64,
    store_timeouts: AtomicU64,
    store_overloaded: AtomicU64,
}

/// Rate limits failure logging: one token per class, refilled once per
/// interval.
#[derive(Debug)]
struct FailureLog {
    interval: Duration,
    buckets: Mutex<HashMap<FailureClass, (TokenBucket, u64)>>,
}

impl FailureLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of failures folded into this log line, or `None`
    /// if the line should be suppressed.
    fn admit(&self, class: FailureClass, now: f64) -> Option<u64> {
        let rate = 1.0 / self.interval.as_secs_f64().max(f64::EPSILON);
        let mut buckets = self.buckets.lock();
        let (bucket, suppressed) = buckets
            .entry(class)
            .or_insert_with(|| (TokenBucket::new(1.0, rate, now), 0));

        let (log, next) = bucket.consume(now, 1.0);
        *bucket = next;

        if log {
            let folded = *suppressed + 1;
            *suppressed = 0;
            Some(folded)
        } else {
            *suppressed += 1;
            None
        }
    }
}

/// Admission across processes through a shared store, with local fallback.
pub struct DistributedLimiter {
    store: Option<Arc<dyn WindowStore>>,
    local: Arc<LocalLimiter>,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    failure_log: FailureLog,
    counters: Counters,
}

impl std::fmt::Debug for DistributedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLimiter")
            .field("has_store", &self.store.is_some())
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats())
            .finish()
    }
}

impl DistributedLimiter {
    /// Create a limiter using `store` as the primary path.
    pub fn new(store: Arc<dyn WindowStore>, local: Arc<LocalLimiter>) -> Self {
        Self {
            store: Some(store),
            local,
            timeout: DEFAULT_STORE_TIMEOUT,
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            failure_log: FailureLog::new(DEFAULT_FAILURE_LOG_INTERVAL),
            counters: Counters::default(),
        }
    }

    /// Create a limiter that only enforces per-process limits.
    pub fn local_only(local: Arc<LocalLimiter>) -> Self {
        Self {
            store: None,
            local,
            timeout: DEFAULT_STORE_TIMEOUT,
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            failure_log: FailureLog::new(DEFAULT_FAILURE_LOG_INTERVAL),
            counters: Counters::default(),
        }
    }

    /// Set the per-call store deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cap the number of store calls outstanding at once.
    ///
    /// A call that times out keeps its slot until the store answers or the
    /// connection gives up, so a stalled store fills the cap and further
    /// checks go straight to the local limiter.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        let max = max.max(1);
        self.in_flight = Arc::new(Semaphore::new(max));
        self.max_in_flight = max;
        self
    }

    /// Store calls currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }

    /// Set the minimum spacing between failure log lines of one class.
    pub fn with_failure_log_interval(mut self, interval: Duration) -> Self {
        self.failure_log = FailureLog::new(interval);
        self
    }

    /// The local limiter used for fallback.
    pub fn local(&self) -> &Arc<LocalLimiter> {
        &self.local
    }

    /// Check and record a request for `key`.
    ///
    /// `now` is only used when the check falls back to the local limiter;
    /// the store path uses the store's clock.
    pub async fn is_allowed(&self, key: &str, limit: u32, window: Duration, now: f64) -> Verdict {
        let Some(store) = &self.store else {
            return self.fallback(key, limit, window, now);
        };

        let request = WindowRequest {
            key: key.to_string(),
            limit,
            window,
            member: uuid::Uuid::new_v4().to_string(),
        };

        match self.call_store(store.clone(), request).await {
            Ok(verdict) => {
                let counter = if verdict.admitted {
                    &self.counters.store_admitted
                } else {
                    &self.counters.store_denied
                };
                counter.fetch_add(1, Ordering::Relaxed);

                trace!(
                    key = %key,
                    limit = limit,
                    admitted = verdict.admitted,
                    "Store decision"
                );

                Verdict {
                    admitted: verdict.admitted,
                    retry_after: verdict.retry_after,
                    now: verdict.now,
                    source: DecisionSource::Store,
                }
            }
            Err(err) => {
                self.record_failure(&err);
                self.fallback(key, limit, window, now)
            }
        }
    }

    /// One attempt at the store, bounded by the configured timeout.
    ///
    /// The call runs on its own task so that cancelling the caller does not
    /// abort a transaction the store may already have applied.
    async fn call_store(
        &self,
        store: Arc<dyn WindowStore>,
        request: WindowRequest,
    ) -> Result<StoreVerdict, StoreError> {
        let permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| StoreError::Overloaded(self.max_in_flight))?;

        let task = tokio::spawn(async move {
            let result = store.admit(&request).await;
            drop(permit);
            result
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "store task failed: {join_err}"
            ))),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn fallback(&self, key: &str, limit: u32, window: Duration, now: f64) -> Verdict {
        self.counters.local_decisions.fetch_add(1, Ordering::Relaxed);
        let decision = self.local.is_allowed(key, limit, window, now);

        Verdict {
            admitted: decision.admitted,
            retry_after: decision.retry_after,
            now,
            source: DecisionSource::Local,
        }
    }

    fn record_failure(&self, err: &StoreError) {
        let counter = match err.class() {
            FailureClass::Unavailable => &self.counters.store_unavailable,
            FailureClass::Timeout => &self.counters.store_timeouts,
            FailureClass::Overloaded => &self.counters.store_overloaded,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match self.failure_log.admit(err.class(), unix_now()) {
            Some(failures) => warn!(
                error = %err,
                failures = failures,
                "Shared store failing, enforcing limits per process"
            ),
            None => debug!(error = %err, "Shared store failure (log suppressed)"),
        }
    }

    /// Current counter values.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            store_admitted: self.counters.store_admitted.load(Ordering::Relaxed),
            store_denied: self.counters.store_denied.load(Ordering::Relaxed),
            local_decisions: self.counters.local_decisions.load(Ordering::Relaxed),
            store_unavailable: self.counters.store_unavailable.load(Ordering::Relaxed),
            store_timeouts: self.counters.store_timeouts.load(Ordering::Relaxed),
            store_overloaded: self.counters.store_overloaded.load(Ordering::Relaxed),
        }
    }
}
