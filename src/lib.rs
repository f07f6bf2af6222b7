//! Gatekeeper - Distributed Rate Limiting and Adaptive Admission Control
//!
//! This crate decides, per request, whether to admit or reject it against
//! configurable quotas shared by every process through a Redis store. Each
//! check is a single atomic script on the store; when the store is slow or
//! unreachable the same check is answered by a process-local sliding window
//! instead. An adaptive controller scales endpoint quotas from observed
//! latency and error rates.

pub mod adaptive;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;

pub use adaptive::{AdaptiveConfig, AdaptiveController, AdjustmentState};
pub use config::GatekeeperConfig;
pub use error::{GateError, Result};
pub use gate::{AdmissionRequest, Decision, RateLimitGate};
