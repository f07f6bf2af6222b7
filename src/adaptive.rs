//! Adaptive quota control.
//!
//! Completed requests feed per-endpoint moving averages of latency and error
//! rate. A periodic evaluation shrinks an endpoint's quota multiplier while
//! it looks unhealthy and grows it back slowly once it recovers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{GateError, Result};

/// Lowest multiplier an endpoint can be driven to.
pub const MIN_MULTIPLIER: f64 = 0.1;
/// Highest multiplier an endpoint can be driven to.
pub const MAX_MULTIPLIER: f64 = 5.0;

const DECREASE_FACTOR: f64 = 0.9;
const INCREASE_FACTOR: f64 = 1.1;

/// Adaptive controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Disable to keep every multiplier at 1.0.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// EWMA smoothing factor; low values react slowly to outliers.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Back off when smoothed latency exceeds this.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Back off when the smoothed error rate exceeds this.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    /// Recover only while smoothed latency stays below this.
    #[serde(default = "default_recover_latency_ms")]
    pub recover_latency_ms: u64,

    /// Recover only while the smoothed error rate stays below this.
    #[serde(default = "default_recover_error_rate")]
    pub recover_error_rate: f64,

    /// Upper bound for recovery, within [0.1, 5.0].
    #[serde(default = "default_multiplier_cap")]
    pub multiplier_cap: f64,

    /// Seconds between evaluations.
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            alpha: default_alpha(),
            latency_threshold_ms: default_latency_threshold_ms(),
            error_threshold: default_error_threshold(),
            recover_latency_ms: default_recover_latency_ms(),
            recover_error_rate: default_recover_error_rate(),
            multiplier_cap: default_multiplier_cap(),
            evaluation_interval_secs: default_evaluation_interval(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_alpha() -> f64 {
    0.1
}

fn default_latency_threshold_ms() -> u64 {
    5000
}

fn default_error_threshold() -> f64 {
    0.1
}

fn default_recover_latency_ms() -> u64 {
    1000
}

fn default_recover_error_rate() -> f64 {
    0.01
}

fn default_multiplier_cap() -> f64 {
    2.0
}

fn default_evaluation_interval() -> u64 {
    30
}

impl AdaptiveConfig {
    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(GateError::Config(format!(
                "adaptive.alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        if !(MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&self.multiplier_cap) {
            return Err(GateError::Config(format!(
                "adaptive.multiplier_cap must be in [{MIN_MULTIPLIER}, {MAX_MULTIPLIER}], got {}",
                self.multiplier_cap
            )));
        }
        if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
            return Err(GateError::Config(format!(
                "adaptive.error_threshold must be in (0, 1], got {}",
                self.error_threshold
            )));
        }
        if self.recover_error_rate > self.error_threshold || self.recover_error_rate < 0.0 {
            return Err(GateError::Config(
                "adaptive.recover_error_rate must be between 0 and error_threshold".to_string(),
            ));
        }
        if self.recover_latency_ms > self.latency_threshold_ms {
            return Err(GateError::Config(
                "adaptive.recover_latency_ms must not exceed latency_threshold_ms".to_string(),
            ));
        }
        if self.evaluation_interval_secs == 0 {
            return Err(GateError::Config(
                "adaptive.evaluation_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

/// Health signals and current multiplier for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdjustmentState {
    /// Smoothed latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Smoothed fraction of failed requests.
    pub error_rate: f64,
    pub multiplier: f64,
    /// Observations recorded so far.
    pub samples: u64,
}

impl Default for AdjustmentState {
    fn default() -> Self {
        Self {
            avg_latency_ms: 0.0,
            error_rate: 0.0,
            multiplier: 1.0,
            samples: 0,
        }
    }
}

/// Per-endpoint AIMD controller over quota multipliers.
///
/// The endpoint set is fixed at construction; each endpoint has its own
/// lock, so recording for one endpoint never waits on another.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    endpoints: HashMap<String, Mutex<AdjustmentState>>,
}

impl AdaptiveController {
    /// Create a controller tracking `endpoints`.
    pub fn new<I, S>(config: AdaptiveConfig, endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;

        let endpoints: HashMap<_, _> = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.into(), Mutex::new(AdjustmentState::default())))
            .collect();

        debug!(endpoints = endpoints.len(), "Adaptive controller created");

        Ok(Self { config, endpoints })
    }

    /// Fold one completed request into the endpoint's averages.
    ///
    /// Returns `false` for endpoints the controller does not track.
    pub fn record(&self, endpoint: &str, latency: Duration, is_error: bool) -> bool {
        let Some(state) = self.endpoints.get(endpoint) else {
            trace!(endpoint = %endpoint, "Ignoring observation for untracked endpoint");
            return false;
        };

        let latency_ms = latency.as_secs_f64() * 1000.0;
        let error = if is_error { 1.0 } else { 0.0 };
        let alpha = self.config.alpha;

        let mut state = state.lock();
        if state.samples == 0 {
            state.avg_latency_ms = latency_ms;
            state.error_rate = error;
        } else {
            state.avg_latency_ms = alpha * latency_ms + (1.0 - alpha) * state.avg_latency_ms;
            state.error_rate = alpha * error + (1.0 - alpha) * state.error_rate;
        }
        state.samples += 1;
        true
    }

    /// Adjust every endpoint's multiplier from its current averages.
    ///
    /// Endpoints without observations are left alone. Returns the number of
    /// endpoints whose multiplier changed.
    pub fn evaluate(&self) -> usize {
        let latency_threshold = self.config.latency_threshold_ms as f64;
        let recover_latency = self.config.recover_latency_ms as f64;
        let mut changed = 0;

        for (endpoint, state) in &self.endpoints {
            let mut state = state.lock();
            if state.samples == 0 {
                continue;
            }

            let previous = state.multiplier;
            if state.error_rate > self.config.error_threshold
                || state.avg_latency_ms > latency_threshold
            {
                state.multiplier *= DECREASE_FACTOR;
            } else if state.error_rate < self.config.recover_error_rate
                && state.avg_latency_ms < recover_latency
            {
                state.multiplier = (state.multiplier * INCREASE_FACTOR).min(self.config.multiplier_cap);
            }
            state.multiplier = state.multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);

            if state.multiplier != previous {
                changed += 1;
                debug!(
                    endpoint = %endpoint,
                    from = previous,
                    to = state.multiplier,
                    avg_latency_ms = state.avg_latency_ms,
                    error_rate = state.error_rate,
                    "Adjusted quota multiplier"
                );
            }
        }

        changed
    }

    /// Current multiplier for `endpoint`; 1.0 when disabled or untracked.
    pub fn multiplier(&self, endpoint: &str) -> f64 {
        if !self.config.enabled {
            return 1.0;
        }
        self.endpoints
            .get(endpoint)
            .map_or(1.0, |state| state.lock().multiplier)
    }

    /// Copy of the endpoint's state.
    pub fn snapshot(&self, endpoint: &str) -> Option<AdjustmentState> {
        self.endpoints.get(endpoint).map(|state| *state.lock())
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Evaluate on the configured interval until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let interval = self.config.evaluation_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing has been observed yet.
        ticker.tick().await;
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Adaptive controller started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let changed = self.evaluate();
                    trace!(changed = changed, "Adaptive evaluation finished");
                }
            }
        }

        info!("Adaptive controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOW: Duration = Duration::from_secs(8);
    const FAST: Duration = Duration::from_millis(20);

    fn controller() -> AdaptiveController {
        AdaptiveController::new(AdaptiveConfig::default(), ["/api/v1/analyze", "default"]).unwrap()
    }

    #[test]
    fn test_untracked_endpoint_is_neutral() {
        let controller = controller();
        assert!(!controller.record("/unknown", FAST, false));
        assert_eq!(controller.multiplier("/unknown"), 1.0);
        assert!(controller.snapshot("/unknown").is_none());
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let controller = controller();
        controller.record("default", Duration::from_millis(400), true);

        let state = controller.snapshot("default").unwrap();
        assert_eq!(state.avg_latency_ms, 400.0);
        assert_eq!(state.error_rate, 1.0);
        assert_eq!(state.samples, 1);
    }

    #[test]
    fn test_ewma_weights_history() {
        let controller = controller();
        controller.record("default", Duration::from_millis(100), false);
        controller.record("default", Duration::from_millis(1100), false);

        // 0.1 * 1100 + 0.9 * 100
        let state = controller.snapshot("default").unwrap();
        assert!((state.avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_samples_no_adjustment() {
        let controller = controller();
        assert_eq!(controller.evaluate(), 0);
        assert_eq!(controller.multiplier("default"), 1.0);
    }

    #[test]
    fn test_sustained_errors_converge_to_floor() {
        let controller = controller();

        for _ in 0..200 {
            controller.record("/api/v1/analyze", FAST, true);
            controller.evaluate();
            let multiplier = controller.multiplier("/api/v1/analyze");
            assert!(multiplier >= MIN_MULTIPLIER);
        }

        assert!((controller.multiplier("/api/v1/analyze") - MIN_MULTIPLIER).abs() < 1e-12);
        // The other endpoint was never touched.
        assert_eq!(controller.multiplier("default"), 1.0);
    }

    #[test]
    fn test_sustained_latency_backs_off() {
        let controller = controller();
        controller.record("default", SLOW, false);
        controller.evaluate();
        assert!((controller.multiplier("default") - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_sustained_health_converges_to_cap() {
        let controller = controller();

        for _ in 0..200 {
            controller.record("default", FAST, false);
            controller.evaluate();
            assert!(controller.multiplier("default") <= 2.0);
        }

        assert_eq!(controller.multiplier("default"), 2.0);
    }

    #[test]
    fn test_recovery_after_outage_is_slower_than_backoff() {
        let controller = controller();
        for _ in 0..5 {
            controller.record("default", SLOW, true);
            controller.evaluate();
        }
        let degraded = controller.multiplier("default");
        assert!(degraded < 0.6);

        // Errors decay slowly through the EWMA, so recovery takes a while.
        let mut rounds = 0;
        while controller.multiplier("default") < 1.0 {
            controller.record("default", FAST, false);
            controller.evaluate();
            rounds += 1;
            assert!(rounds < 1000);
        }
        assert!(rounds > 5);
    }

    #[test]
    fn test_grey_zone_holds_multiplier() {
        let controller = controller();
        // Between recovery and backoff thresholds.
        controller.record("default", Duration::from_millis(2500), false);
        assert_eq!(controller.evaluate(), 0);
        assert_eq!(controller.multiplier("default"), 1.0);
    }

    #[test]
    fn test_disabled_controller_reports_neutral_multiplier() {
        let config = AdaptiveConfig {
            enabled: false,
            ..AdaptiveConfig::default()
        };
        let controller = AdaptiveController::new(config, ["default"]).unwrap();
        controller.record("default", FAST, true);
        controller.evaluate();
        assert_eq!(controller.multiplier("default"), 1.0);
    }

    #[test]
    fn test_config_validation() {
        let bad_cap = AdaptiveConfig {
            multiplier_cap: 6.0,
            ..AdaptiveConfig::default()
        };
        assert!(bad_cap.validate().is_err());

        let bad_alpha = AdaptiveConfig {
            alpha: 0.0,
            ..AdaptiveConfig::default()
        };
        assert!(AdaptiveController::new(bad_alpha, ["x"]).is_err());

        let inverted = AdaptiveConfig {
            recover_latency_ms: 9000,
            ..AdaptiveConfig::default()
        };
        assert!(inverted.validate().is_err());

        assert!(AdaptiveConfig::default().validate().is_ok());
    }

    #[test]
    fn test_concurrent_recording() {
        let controller = Arc::new(controller());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let controller = controller.clone();
                std::thread::spawn(move || {
                    let endpoint = if i % 2 == 0 { "default" } else { "/api/v1/analyze" };
                    for _ in 0..1000 {
                        controller.record(endpoint, FAST, false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(controller.snapshot("default").unwrap().samples, 4000);
        assert_eq!(controller.snapshot("/api/v1/analyze").unwrap().samples, 4000);
    }
}
