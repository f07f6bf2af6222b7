//! Configuration management for Gatekeeper.
//!
//! Configuration is read once at startup from an optional YAML file and
//! `GATEKEEPER__`-prefixed environment variables (double underscore between
//! path segments, e.g. `GATEKEEPER__STORE__TIMEOUT_MS=25`), then validated
//! before anything is built from it.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

use crate::adaptive::AdaptiveConfig;
use crate::error::{GateError, Result};
use crate::ratelimit::PolicyConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the admission gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Endpoint and role quota tables
    #[serde(default)]
    pub policies: PolicyConfig,

    /// Adaptive controller tuning
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Process-local limiter configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Request-facing gate configuration
    #[serde(default)]
    pub gate: GateConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one every process enforces limits on its own
    #[serde(default)]
    pub url: Option<String>,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Minimum seconds between store failure log lines of one kind
    #[serde(default = "default_failure_log_interval")]
    pub failure_log_interval_secs: u64,

    /// Maximum store calls outstanding at once; beyond it checks go local
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
            failure_log_interval_secs: default_failure_log_interval(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn failure_log_interval(&self) -> Duration {
        Duration::from_secs(self.failure_log_interval_secs)
    }
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_failure_log_interval() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    crate::ratelimit::DEFAULT_MAX_IN_FLIGHT
}

/// Process-local limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Seconds between idle key sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LocalConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Request-facing gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Address of the one proxy hop whose `X-Forwarded-For` is trusted
    #[serde(default)]
    pub trusted_proxy: Option<IpAddr>,
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that must not serve traffic.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(GateError::Config(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.failure_log_interval_secs == 0 {
            return Err(GateError::Config(
                "store.failure_log_interval_secs must be positive".to_string(),
            ));
        }
        if self.store.max_in_flight == 0 {
            return Err(GateError::Config(
                "store.max_in_flight must be positive".to_string(),
            ));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(GateError::Config(
                "local.sweep_interval_secs must be positive".to_string(),
            ));
        }
        self.policies.validate()?;
        self.adaptive.validate()?;
        Ok(())
    }
}
