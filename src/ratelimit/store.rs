//! Shared store abstraction used by the distributed limiter.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failures talking to the shared store.
///
/// Every variant is transient from the limiter's point of view: they
/// trigger the local fallback and are never surfaced to callers.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store could not be reached or the script failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the per-call budget.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Too many store calls are already outstanding.
    #[error("store has {0} calls in flight")]
    Overloaded(usize),
}

impl StoreError {
    /// Failure class used to throttle log output.
    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::Unavailable(_) => FailureClass::Unavailable,
            StoreError::Timeout(_) => FailureClass::Timeout,
            StoreError::Overloaded(_) => FailureClass::Overloaded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Unavailable,
    Timeout,
    Overloaded,
}

/// One sliding window admission to run atomically in the store.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Fully qualified store key.
    pub key: String,
    /// Maximum members allowed in the window.
    pub limit: u32,
    /// Window length; also the key's expiry.
    pub window: Duration,
    /// Unique member id recorded on admission.
    pub member: String,
}

/// Result of a store-side admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreVerdict {
    pub admitted: bool,
    /// Seconds until a slot frees up, set only on rejection.
    pub retry_after: Option<u64>,
    /// The store's clock at decision time, in seconds since the epoch.
    pub now: f64,
}

/// A key-value store able to run the sliding window admission as a single
/// indivisible step.
///
/// Implementations must evict expired members, count, conditionally insert
/// and refresh the expiry without any other caller observing an
/// intermediate state, using the store's own clock for `now`.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn admit(&self, request: &WindowRequest) -> Result<StoreVerdict, StoreError>;
}
