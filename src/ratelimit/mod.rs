//! Rate limiting algorithms, limiters and policy resolution.

mod algorithm;
mod distributed;
mod key;
mod local;
mod memory;
mod policy;
mod redis;
mod store;

pub use algorithm::{sliding_window, TokenBucket, WindowDecision};
pub use distributed::{
    DecisionSource, DistributedLimiter, LimiterStats, Verdict, DEFAULT_FAILURE_LOG_INTERVAL,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_STORE_TIMEOUT,
};
pub use key::LimitingKey;
pub use local::LocalLimiter;
pub use memory::MemoryStore;
pub use policy::{
    EndpointRule, Policy, PolicyConfig, PolicyResolver, PolicyRule, ResolvedPolicy, DEFAULT_POLICY,
};
pub use self::redis::RedisStore;
pub use store::{FailureClass, StoreError, StoreVerdict, WindowRequest, WindowStore};

/// Wall clock time in seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
