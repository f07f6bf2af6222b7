//! Request-facing admission gate.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::adaptive::AdaptiveController;
use crate::config::GatekeeperConfig;
use crate::error::Result;
use crate::ratelimit::{
    DecisionSource, DistributedLimiter, LimitingKey, LocalLimiter, PolicyResolver, WindowStore,
};

/// One request to be admitted or rejected.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Request path
    pub endpoint: &'a str,
    /// Authenticated caller id, if any
    pub principal: Option<&'a str>,
    /// Address of the directly connected peer
    pub client_ip: &'a str,
    /// Raw `X-Forwarded-For` header, honoured only from the trusted proxy
    pub forwarded_for: Option<&'a str>,
    /// Caller role used for quota multipliers
    pub role: &'a str,
    /// Caller clock, seconds since the epoch
    pub now: f64,
}

/// Admission decision plus the metadata a host surfaces as
/// `X-RateLimit-Limit`, `X-RateLimit-Window`, `X-RateLimit-Reset` and
/// `Retry-After`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub admitted: bool,
    /// Effective request limit for the window
    pub limit: u32,
    /// Window length in seconds
    pub window: u64,
    /// Epoch second at which the caller regains capacity
    pub reset_epoch: i64,
    /// Seconds to wait before retrying; set only when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Limiting key the request was counted against
    pub key: String,
    /// Whether the shared store or the local fallback decided
    pub source: DecisionSource,
}

/// The façade a host calls once per request.
#[derive(Debug)]
pub struct RateLimitGate {
    resolver: PolicyResolver,
    limiter: Arc<DistributedLimiter>,
    adaptive: Arc<AdaptiveController>,
    key_prefix: String,
    trusted_proxy: Option<IpAddr>,
}

impl RateLimitGate {
    /// Assemble a gate from validated configuration.
    ///
    /// `store` is the shared store, or `None` to enforce limits per process.
    pub fn from_config(
        config: &GatekeeperConfig,
        store: Option<Arc<dyn WindowStore>>,
        local: Arc<LocalLimiter>,
    ) -> Result<Self> {
        config.validate()?;

        let adaptive = Arc::new(AdaptiveController::new(
            config.adaptive.clone(),
            config.policies.policy_names(),
        )?);
        let resolver = PolicyResolver::new(&config.policies)?.with_adaptive(adaptive.clone());

        let limiter = match store {
            Some(store) => DistributedLimiter::new(store, local),
            None => DistributedLimiter::local_only(local),
        }
        .with_timeout(config.store.timeout())
        .with_max_in_flight(config.store.max_in_flight)
        .with_failure_log_interval(config.store.failure_log_interval());

        Ok(Self {
            resolver,
            limiter: Arc::new(limiter),
            adaptive,
            key_prefix: config.store.key_prefix.clone(),
            trusted_proxy: config.gate.trusted_proxy,
        })
    }

    /// Decide whether `request` may proceed.
    ///
    /// A denial is a normal `Ok` decision. Errors are reserved for
    /// configuration problems such as an endpoint no policy covers.
    #[instrument(skip(self, request), fields(endpoint = %request.endpoint, role = %request.role))]
    pub async fn check(&self, request: &AdmissionRequest<'_>) -> Result<Decision> {
        let resolved = self.resolver.resolve(request.endpoint, request.role)?;
        let policy = &resolved.policy;

        let key = LimitingKey::derive(
            request.principal,
            request.client_ip,
            request.forwarded_for,
            self.trusted_proxy,
        );
        let store_key = key.scoped(&self.key_prefix, &policy.endpoint);

        let verdict = self
            .limiter
            .is_allowed(&store_key, resolved.effective_max, policy.window(), request.now)
            .await;

        let now = verdict.now.floor() as i64;
        let reset_epoch = match verdict.retry_after {
            Some(retry_after) if !verdict.admitted => now + retry_after as i64,
            _ => now + policy.window_seconds as i64,
        };

        let decision = Decision {
            admitted: verdict.admitted,
            limit: resolved.effective_max,
            window: policy.window_seconds,
            reset_epoch,
            retry_after_seconds: if verdict.admitted { None } else { verdict.retry_after },
            key: key.to_string(),
            source: verdict.source,
        };

        if decision.admitted {
            trace!(key = %decision.key, limit = decision.limit, "Request admitted");
        } else {
            debug!(
                key = %decision.key,
                policy = %policy.endpoint,
                limit = decision.limit,
                retry_after = ?decision.retry_after_seconds,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Feed a completed request's outcome to the adaptive controller.
    pub fn observe(&self, endpoint: &str, latency: Duration, is_error: bool) {
        match self.resolver.match_endpoint(endpoint) {
            Ok(policy) => {
                self.adaptive.record(&policy.endpoint, latency, is_error);
            }
            Err(_) => trace!(endpoint = %endpoint, "No policy for observed endpoint"),
        }
    }

    /// Start the local idle sweep and the adaptive evaluation loop.
    ///
    /// Both tasks stop when `shutdown` resolves.
    pub fn spawn_background_tasks<F>(&self, sweep_interval: Duration, shutdown: F) -> Vec<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = shutdown.shared();
        vec![
            tokio::spawn(
                self.limiter
                    .local()
                    .clone()
                    .run_sweeper(sweep_interval, shutdown.clone()),
            ),
            tokio::spawn(self.adaptive.clone().run(shutdown)),
        ]
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn limiter(&self) -> &Arc<DistributedLimiter> {
        &self.limiter
    }

    pub fn adaptive(&self) -> &Arc<AdaptiveController> {
        &self.adaptive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;
    use crate::ratelimit::{MemoryStore, DEFAULT_POLICY};

    const NOW: f64 = 1_700_000_000.25;

    fn request<'a>(endpoint: &'a str, principal: Option<&'a str>, role: &'a str) -> AdmissionRequest<'a> {
        AdmissionRequest {
            endpoint,
            principal,
            client_ip: "203.0.113.5",
            forwarded_for: None,
            role,
            now: NOW,
        }
    }

    fn gate_with_store(yaml: &str) -> (RateLimitGate, Arc<MemoryStore>) {
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        let store = Arc::new(MemoryStore::with_clock(|| NOW));
        let gate = RateLimitGate::from_config(&config, Some(store.clone()), Arc::new(LocalLimiter::new()))
            .unwrap();
        (gate, store)
    }

    const SMALL: &str = r#"
store:
  timeout_ms: 2000
policies:
  default:
    max_requests: 5
    window_seconds: 60
  endpoints:
    - prefix: /api/v1/reports
      max_requests: 10
      window_seconds: 60
  roles:
    elevated: 2.0
"#;

    #[tokio::test]
    async fn test_sixth_request_denied_with_metadata() {
        let (gate, _) = gate_with_store(SMALL);
        let req = request("/api/v1/teams", Some("42"), "standard");

        for _ in 0..5 {
            let decision = gate.check(&req).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.window, 60);
            assert_eq!(decision.reset_epoch, 1_700_000_060);
            assert_eq!(decision.retry_after_seconds, None);
            assert_eq!(decision.key, "principal:42");
            assert_eq!(decision.source, DecisionSource::Store);
        }

        let decision = gate.check(&req).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_seconds, Some(60));
        assert_eq!(decision.reset_epoch, 1_700_000_060);
    }

    #[tokio::test]
    async fn test_role_multiplier_doubles_quota() {
        let (gate, _) = gate_with_store(SMALL);
        let req = request("/api/v1/reports/1", Some("7"), "elevated");

        let decision = gate.check(&req).await.unwrap();
        assert_eq!(decision.limit, 20);

        let mut admitted = 1;
        while gate.check(&req).await.unwrap().admitted {
            admitted += 1;
            assert!(admitted <= 20);
        }
        assert_eq!(admitted, 20);
    }

    #[tokio::test]
    async fn test_quotas_are_scoped_per_policy() {
        let (gate, store) = gate_with_store(SMALL);

        gate.check(&request("/api/v1/reports", Some("1"), "")).await.unwrap();
        gate.check(&request("/other", Some("1"), "")).await.unwrap();

        assert_eq!(store.member_count("rate_limit:/api/v1/reports|principal:1"), 1);
        assert_eq!(store.member_count("rate_limit:default|principal:1"), 1);
    }

    #[tokio::test]
    async fn test_anonymous_callers_keyed_by_address() {
        let (gate, _) = gate_with_store(SMALL);
        let decision = gate.check(&request("/x", None, "")).await.unwrap();
        assert_eq!(decision.key, "ip:203.0.113.5");
    }

    #[tokio::test]
    async fn test_trusted_proxy_forwarded_address() {
        let yaml = format!("{SMALL}gate:\n  trusted_proxy: 10.0.0.1\n");
        let (gate, _) = gate_with_store(&yaml);

        let req = AdmissionRequest {
            client_ip: "10.0.0.1",
            forwarded_for: Some("198.51.100.7"),
            ..request("/x", None, "")
        };
        assert_eq!(gate.check(&req).await.unwrap().key, "ip:198.51.100.7");
    }

    #[tokio::test]
    async fn test_store_outage_keeps_enforcing_locally() {
        let (gate, store) = gate_with_store(SMALL);
        store.set_available(false);
        let req = request("/x", Some("42"), "");

        for _ in 0..5 {
            let decision = gate.check(&req).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.source, DecisionSource::Local);
        }
        let decision = gate.check(&req).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_without_default_is_error() {
        let yaml = r#"
policies:
  default: null
  endpoints:
    - prefix: /api
      max_requests: 1
      window_seconds: 1
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        let gate = RateLimitGate::from_config(&config, None, Arc::new(LocalLimiter::new())).unwrap();

        let err = gate.check(&request("/metrics", None, "")).await.unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
        assert!(gate.check(&request("/api/x", None, "")).await.is_ok());
    }

    #[tokio::test]
    async fn test_observations_shrink_quota() {
        let (gate, _) = gate_with_store(SMALL);

        for _ in 0..3 {
            gate.observe("/anything", Duration::from_millis(10), true);
        }
        gate.observe("/api/v1/reports/9", Duration::from_millis(10), false);
        gate.adaptive().evaluate();

        let default_state = gate.adaptive().snapshot(DEFAULT_POLICY).unwrap();
        assert_eq!(default_state.samples, 3);
        assert!((default_state.multiplier - 0.9).abs() < 1e-12);

        // 5 * 0.9 = 4.5, rounded away from zero.
        let decision = gate.check(&request("/anything", Some("1"), "")).await.unwrap();
        assert_eq!(decision.limit, 5);

        gate.observe("/anything", Duration::from_millis(10), true);
        gate.adaptive().evaluate();
        // 5 * 0.81 = 4.05
        let decision = gate.check(&request("/anything", Some("1"), "")).await.unwrap();
        assert_eq!(decision.limit, 4);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let config = GatekeeperConfig::default();
        let gate = RateLimitGate::from_config(&config, None, Arc::new(LocalLimiter::new())).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handles = gate.spawn_background_tasks(Duration::from_millis(10), async {
            let _ = rx.await;
        });
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("task should stop")
                .unwrap();
        }
    }

    #[test]
    fn test_decision_serializes_without_retry_when_admitted() {
        let decision = Decision {
            admitted: true,
            limit: 5,
            window: 60,
            reset_epoch: 100,
            retry_after_seconds: None,
            key: "ip:1.2.3.4".to_string(),
            source: DecisionSource::Local,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["source"], "local");
        assert!(json.get("retry_after_seconds").is_none());
    }

    #[test]
    fn test_check_completes_on_plain_executor() {
        let config = GatekeeperConfig::default();
        let gate = RateLimitGate::from_config(&config, None, Arc::new(LocalLimiter::new())).unwrap();

        let decision = tokio_test::block_on(gate.check(&request("/api/v1/predict/trends", None, "trial")))
            .unwrap();
        // 5 * 0.5 = 2.5 rounds to 3.
        assert_eq!(decision.limit, 3);
        assert!(decision.admitted);
    }
}
