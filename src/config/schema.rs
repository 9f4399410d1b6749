//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gatekeeper.
//! All types derive Serde traits for deserialization from config files, and every
//! section falls back to documented defaults so a minimal file is valid.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Public listener (admission-controlled traffic).
    pub listener: ListenerConfig,

    /// Where the client credential is read from.
    pub credentials: CredentialConfig,

    /// Fixed-window rate limiting on IP and credential.
    pub rate_limit: RateLimitConfig,

    /// Daily/monthly quotas and graduated throttling.
    pub throttle: ThrottleConfig,

    /// Circuit breakers and the execution coordinator.
    pub fault_tolerance: FaultToleranceConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Administrative API.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Whole-request timeout in seconds, throttle delay included.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Credential extraction settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Header carrying the client credential.
    pub header_name: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            header_name: "X-API-Key".to_string(),
        }
    }
}

/// Per-minute and per-hour ceilings for one scope.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Limits keyed on client IP.
    pub ip_limits: WindowLimits,

    /// Limits keyed on credential (usually higher than IP limits).
    pub credential_limits: WindowLimits,

    /// Paths that bypass every admission check (exact or `prefix/...`).
    pub exclude_paths: Vec<String>,

    /// Value of `Retry-After` on rejections.
    pub retry_after_secs: u64,

    /// Honour X-Forwarded-For / X-Real-IP.
    pub trust_proxy_headers: bool,

    /// Peers allowed to set forwarding headers (IPs or CIDRs). Empty = any peer.
    pub trusted_proxies: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_limits: WindowLimits::default(),
            credential_limits: WindowLimits {
                requests_per_minute: 120,
                requests_per_hour: 5000,
            },
            exclude_paths: vec![
                "/health".to_string(),
                "/favicon.ico".to_string(),
                "/metrics".to_string(),
                "/static".to_string(),
            ],
            retry_after_secs: 60,
            trust_proxy_headers: false,
            trusted_proxies: Vec::new(),
        }
    }
}

/// Shape of the throttle delay curve above the threshold.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DelayCurve {
    #[default]
    Exponential,
    Linear,
}

/// Throttle delay settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DelayConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    pub curve: DelayCurve,
    /// Usage percentage (0-100) at which delays start.
    pub threshold_percent: f64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_ms: 100,
            max_ms: 5000,
            curve: DelayCurve::Exponential,
            threshold_percent: 70.0,
        }
    }
}

/// Global quota defaults applied to credentials without stored settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultQuotas {
    /// `None` means unlimited.
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
}

impl Default for DefaultQuotas {
    fn default() -> Self {
        Self {
            daily_limit: Some(10_000),
            monthly_limit: Some(100_000),
        }
    }
}

/// One row of the priority → delay multiplier table.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PriorityMultiplier {
    pub priority: u8,
    pub multiplier: f64,
}

/// Quota and throttling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Enable quota tracking and throttling.
    pub enabled: bool,

    pub default_quotas: DefaultQuotas,

    pub delay: DelayConfig,

    /// Multipliers for listed priorities; others are linearly interpolated.
    pub priority_multipliers: Vec<PriorityMultiplier>,

    /// Extra paths excluded from throttling (rate limit exclusions also apply).
    pub exclude_paths: Vec<String>,

    /// How often fast counters are copied to durable storage.
    pub usage_sync_interval_secs: u64,

    /// How long resolved quota configs are cached.
    pub config_cache_ttl_secs: u64,

    /// JSON file holding quota configs and usage snapshots. `None` keeps them in memory.
    pub persistence_path: Option<String>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_quotas: DefaultQuotas::default(),
            delay: DelayConfig::default(),
            priority_multipliers: vec![
                PriorityMultiplier { priority: 1, multiplier: 0.5 },
                PriorityMultiplier { priority: 5, multiplier: 1.0 },
                PriorityMultiplier { priority: 10, multiplier: 2.0 },
            ],
            exclude_paths: Vec::new(),
            usage_sync_interval_secs: 60,
            config_cache_ttl_secs: 300,
            persistence_path: None,
        }
    }
}

/// Global circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures (or failures inside `failure_window_secs`) that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// Base time spent OPEN before probing.
    pub recovery_timeout_ms: u64,

    /// Ceiling for the backed-off recovery timeout.
    pub max_recovery_timeout_ms: u64,

    /// Double the recovery timeout on every re-open.
    pub exponential_backoff: bool,

    /// Count failures inside this window instead of consecutive failures.
    pub failure_window_secs: Option<u64>,

    /// Minimum time between opportunistic history cleanups.
    pub cleanup_interval_secs: u64,

    /// History records older than this are dropped.
    pub retention_period_secs: u64,

    pub max_call_history: usize,

    pub max_transition_history: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_ms: 60_000,
            max_recovery_timeout_ms: 300_000,
            exponential_backoff: true,
            failure_window_secs: None,
            cleanup_interval_secs: 3600,
            retention_period_secs: 86_400,
            max_call_history: 1000,
            max_transition_history: 100,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn max_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.max_recovery_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    pub fn failure_window(&self) -> Option<Duration> {
        self.failure_window_secs.map(Duration::from_secs)
    }

    /// Apply a per-resource override on top of this config.
    pub fn merged(&self, over: &ResourceOverride) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: over.failure_threshold.unwrap_or(self.failure_threshold),
            success_threshold: over.success_threshold.unwrap_or(self.success_threshold),
            recovery_timeout_ms: over.recovery_timeout_ms.unwrap_or(self.recovery_timeout_ms),
            max_recovery_timeout_ms: over
                .max_recovery_timeout_ms
                .unwrap_or(self.max_recovery_timeout_ms),
            exponential_backoff: over.exponential_backoff.unwrap_or(self.exponential_backoff),
            failure_window_secs: over.failure_window_secs.or(self.failure_window_secs),
            cleanup_interval_secs: over.cleanup_interval_secs.unwrap_or(self.cleanup_interval_secs),
            retention_period_secs: over.retention_period_secs.unwrap_or(self.retention_period_secs),
            max_call_history: over.max_call_history.unwrap_or(self.max_call_history),
            max_transition_history: over
                .max_transition_history
                .unwrap_or(self.max_transition_history),
        }
    }
}

/// Per-resource settings; unset fields inherit the global values.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ResourceOverride {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub max_recovery_timeout_ms: Option<u64>,
    pub exponential_backoff: Option<bool>,
    pub failure_window_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub retention_period_secs: Option<u64>,
    pub max_call_history: Option<usize>,
    pub max_transition_history: Option<usize>,
    pub operation_timeout_ms: Option<u64>,
}

/// Execution coordinator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default per-resource operation timeout.
    pub operation_timeout_ms: u64,

    /// Resources invoked concurrently within one execution.
    pub max_concurrent: usize,

    /// How long shutdown waits for in-flight executions.
    pub shutdown_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 30_000,
            max_concurrent: 10,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Fault tolerance configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FaultToleranceConfig {
    pub breaker: BreakerConfig,
    pub execution: ExecutionConfig,
    /// Overrides keyed by resource name.
    pub resources: HashMap<String, ResourceOverride>,
}

impl FaultToleranceConfig {
    /// Effective breaker config for a resource.
    pub fn breaker_for(&self, resource: &str) -> BreakerConfig {
        match self.resources.get(resource) {
            Some(over) => self.breaker.merged(over),
            None => self.breaker.clone(),
        }
    }

    /// Effective operation timeout for a resource.
    pub fn operation_timeout_for(&self, resource: &str) -> Duration {
        let ms = self
            .resources
            .get(resource)
            .and_then(|o| o.operation_timeout_ms)
            .unwrap_or(self.execution.operation_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: GatekeeperConfig = toml::from_str("").unwrap();
        assert_eq!(config.rate_limit.ip_limits.requests_per_minute, 60);
        assert_eq!(config.rate_limit.credential_limits.requests_per_hour, 5000);
        assert_eq!(config.throttle.default_quotas.daily_limit, Some(10_000));
        assert_eq!(config.throttle.delay.curve, DelayCurve::Exponential);
        assert_eq!(config.fault_tolerance.breaker.failure_threshold, 5);
        assert_eq!(config.credentials.header_name, "X-API-Key");
    }

    #[test]
    fn test_resource_override_merges_over_global() {
        let raw = r#"
            [fault_tolerance.breaker]
            failure_threshold = 4
            recovery_timeout_ms = 1000

            [fault_tolerance.resources.search]
            failure_threshold = 2
            operation_timeout_ms = 250
        "#;
        let config: GatekeeperConfig = toml::from_str(raw).unwrap();
        let ft = &config.fault_tolerance;

        let search = ft.breaker_for("search");
        assert_eq!(search.failure_threshold, 2);
        assert_eq!(search.recovery_timeout_ms, 1000);
        assert_eq!(ft.operation_timeout_for("search"), Duration::from_millis(250));

        let other = ft.breaker_for("other");
        assert_eq!(other.failure_threshold, 4);
        assert_eq!(ft.operation_timeout_for("other"), Duration::from_millis(30_000));
    }

    #[test]
    fn test_priority_table_and_curve_parse() {
        let raw = r#"
            [throttle.delay]
            curve = "linear"
            threshold_percent = 80

            [[throttle.priority_multipliers]]
            priority = 1
            multiplier = 0.25

            [[throttle.priority_multipliers]]
            priority = 10
            multiplier = 3.0
        "#;
        let config: GatekeeperConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.throttle.delay.curve, DelayCurve::Linear);
        assert_eq!(config.throttle.delay.threshold_percent, 80.0);
        assert_eq!(config.throttle.priority_multipliers.len(), 2);
        assert_eq!(config.throttle.priority_multipliers[1].multiplier, 3.0);
    }
}
