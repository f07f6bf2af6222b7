//! Endpoint quota policies and their resolution.
//!
//! Policies come from a static table of endpoint prefixes plus an optional
//! global default. Resolution picks the longest matching prefix, then scales
//! the base quota by the caller's role and the endpoint's live adaptive
//! multiplier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};

use crate::adaptive::AdaptiveController;
use crate::error::{GateError, Result};

/// Name under which the global default policy is tracked.
pub const DEFAULT_POLICY: &str = "default";

/// A base quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Requests allowed per window before role/adaptive scaling
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// A quota bound to an endpoint prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Path prefix this rule applies to
    pub prefix: String,
    pub max_requests: u32,
    pub window_seconds: u64,
}

/// The policy table as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Quota for endpoints matching no prefix. Without it such endpoints
    /// are a configuration error.
    #[serde(default = "default_policy")]
    pub default: Option<PolicyRule>,

    /// Per-endpoint quotas, matched by longest prefix
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointRule>,

    /// Role name to quota multiplier. Unknown roles get 1.0.
    #[serde(default = "default_roles")]
    pub roles: HashMap<String, f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default: default_policy(),
            endpoints: default_endpoints(),
            roles: default_roles(),
        }
    }
}

fn default_policy() -> Option<PolicyRule> {
    Some(PolicyRule {
        max_requests: 100,
        window_seconds: 3600,
    })
}

fn default_endpoints() -> Vec<EndpointRule> {
    [
        ("/api/v1/analyze/comprehensive", 10, 3600),
        ("/api/v1/analyze/cognitive", 20, 3600),
        ("/api/v1/analyze/talent", 20, 3600),
        ("/api/v1/analyze/culture", 30, 3600),
        ("/api/v1/predict/trends", 5, 3600),
        ("/api/v1/optimize/processes", 15, 3600),
        ("/api/v1/auth/login", 5, 900),
        ("/api/v1/auth/refresh", 10, 3600),
    ]
    .into_iter()
    .map(|(prefix, max_requests, window_seconds)| EndpointRule {
        prefix: prefix.to_string(),
        max_requests,
        window_seconds,
    })
    .collect()
}

fn default_roles() -> HashMap<String, f64> {
    [("admin", 5.0), ("premium", 3.0), ("standard", 1.0), ("trial", 0.5)]
        .into_iter()
        .map(|(role, multiplier)| (role.to_string(), multiplier))
        .collect()
}

impl PolicyConfig {
    /// Check every rule and multiplier.
    pub fn validate(&self) -> Result<()> {
        if let Some(rule) = &self.default {
            check_window(DEFAULT_POLICY, rule.window_seconds)?;
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.endpoints {
            if rule.prefix.is_empty() {
                return Err(GateError::Config(
                    "endpoint policy with empty prefix".to_string(),
                ));
            }
            if !seen.insert(rule.prefix.as_str()) {
                return Err(GateError::Config(format!(
                    "duplicate endpoint policy for {}",
                    rule.prefix
                )));
            }
            check_window(&rule.prefix, rule.window_seconds)?;
        }

        let mut roles = std::collections::HashSet::new();
        for (role, multiplier) in &self.roles {
            if !multiplier.is_finite() || *multiplier <= 0.0 {
                return Err(GateError::Config(format!(
                    "role {role} has invalid multiplier {multiplier}"
                )));
            }
            if !roles.insert(role.to_ascii_lowercase()) {
                return Err(GateError::Config(format!(
                    "role {role} is configured more than once"
                )));
            }
        }

        Ok(())
    }

    /// Names of every policy the resolver can produce.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|r| r.prefix.clone()).collect();
        if self.default.is_some() {
            names.push(DEFAULT_POLICY.to_string());
        }
        names
    }
}

fn check_window(name: &str, window_seconds: u64) -> Result<()> {
    if window_seconds == 0 {
        return Err(GateError::Config(format!(
            "policy {name} has a zero-length window"
        )));
    }
    Ok(())
}

/// A validated base quota. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    /// Matched endpoint prefix, or [`DEFAULT_POLICY`].
    pub endpoint: String,
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Policy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// A policy scaled for one caller at one moment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    pub policy: Arc<Policy>,
    /// Requests allowed in the window after all multipliers.
    pub effective_max: u32,
}

/// Maps (endpoint, role) to a concrete quota.
#[derive(Debug)]
pub struct PolicyResolver {
    /// Sorted by prefix length, longest first.
    endpoints: Vec<Arc<Policy>>,
    default: Option<Arc<Policy>>,
    roles: HashMap<String, f64>,
    adaptive: Option<Arc<AdaptiveController>>,
}

impl PolicyResolver {
    /// Validate `config` and build the lookup table.
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        config.validate()?;

        let mut endpoints: Vec<Arc<Policy>> = config
            .endpoints
            .iter()
            .map(|rule| {
                Arc::new(Policy {
                    endpoint: rule.prefix.clone(),
                    max_requests: rule.max_requests,
                    window_seconds: rule.window_seconds,
                })
            })
            .collect();
        endpoints.sort_by(|a, b| b.endpoint.len().cmp(&a.endpoint.len()));

        let default = config.default.map(|rule| {
            Arc::new(Policy {
                endpoint: DEFAULT_POLICY.to_string(),
                max_requests: rule.max_requests,
                window_seconds: rule.window_seconds,
            })
        });

        info!(
            endpoints = endpoints.len(),
            has_default = default.is_some(),
            roles = config.roles.len(),
            "Policy table loaded"
        );

        Ok(Self {
            endpoints,
            default,
            roles: config
                .roles
                .iter()
                .map(|(role, multiplier)| (role.to_ascii_lowercase(), *multiplier))
                .collect(),
            adaptive: None,
        })
    }

    /// Scale quotas by the controller's live multipliers.
    pub fn with_adaptive(mut self, adaptive: Arc<AdaptiveController>) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// The base policy governing `endpoint`.
    pub fn match_endpoint(&self, endpoint: &str) -> Result<&Arc<Policy>> {
        self.endpoints
            .iter()
            .find(|policy| endpoint.starts_with(policy.endpoint.as_str()))
            .or(self.default.as_ref())
            .ok_or_else(|| {
                GateError::Config(format!("no rate limit policy applies to {endpoint}"))
            })
    }

    /// Multiplier configured for `role`, matched case-insensitively.
    pub fn role_multiplier(&self, role: &str) -> f64 {
        self.roles
            .get(&role.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(1.0)
    }

    /// Resolve the quota for a caller with `role` on `endpoint`.
    pub fn resolve(&self, endpoint: &str, role: &str) -> Result<ResolvedPolicy> {
        let policy = self.match_endpoint(endpoint)?;
        let role_multiplier = self.role_multiplier(role);
        let adjustment = self
            .adaptive
            .as_ref()
            .map_or(1.0, |adaptive| adaptive.multiplier(&policy.endpoint));

        let effective_max = effective_max(policy.max_requests, role_multiplier * adjustment);

        trace!(
            endpoint = %endpoint,
            policy = %policy.endpoint,
            role = %role,
            role_multiplier = role_multiplier,
            adjustment = adjustment,
            effective_max = effective_max,
            "Resolved policy"
        );

        Ok(ResolvedPolicy {
            policy: policy.clone(),
            effective_max,
        })
    }

    /// All base policies, longest prefix first, default last.
    pub fn policies(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.endpoints.iter().chain(self.default.iter())
    }
}

fn effective_max(base: u32, multiplier: f64) -> u32 {
    let scaled = (f64::from(base) * multiplier).round();
    if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        (scaled as u32).max(1)
    }
}
