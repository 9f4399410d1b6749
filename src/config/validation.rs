//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, threshold in (0, 100), min <= max delay)
//! - Check the priority table is usable for interpolation
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatekeeperConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::config::schema::{BreakerConfig, GatekeeperConfig, WindowLimits};
use crate::security::client_ip::TrustedProxy;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate the whole configuration, collecting every error.
pub fn validate_config(config: &GatekeeperConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.credentials.header_name.trim().is_empty() {
        errors.push(ValidationError::new("credentials.header_name", "must not be empty"));
    } else if HeaderName::try_from(config.credentials.header_name.as_str()).is_err() {
        errors.push(ValidationError::new(
            "credentials.header_name",
            "is not a valid HTTP header name",
        ));
    }

    let rl = &config.rate_limit;
    check_limits(&mut errors, "rate_limit.ip_limits", &rl.ip_limits);
    check_limits(&mut errors, "rate_limit.credential_limits", &rl.credential_limits);
    for (i, proxy) in rl.trusted_proxies.iter().enumerate() {
        if proxy.parse::<TrustedProxy>().is_err() {
            errors.push(ValidationError::new(
                format!("rate_limit.trusted_proxies[{}]", i),
                format!("'{}' is not an IP address or CIDR", proxy),
            ));
        }
    }

    let th = &config.throttle;
    if th.delay.min_ms > th.delay.max_ms {
        errors.push(ValidationError::new(
            "throttle.delay",
            format!("min_ms ({}) exceeds max_ms ({})", th.delay.min_ms, th.delay.max_ms),
        ));
    }
    if !(th.delay.threshold_percent > 0.0 && th.delay.threshold_percent < 100.0) {
        errors.push(ValidationError::new(
            "throttle.delay.threshold_percent",
            "must be strictly between 0 and 100",
        ));
    }
    if th.default_quotas.daily_limit == Some(0) {
        errors.push(ValidationError::new("throttle.default_quotas.daily_limit", "must be > 0"));
    }
    if th.default_quotas.monthly_limit == Some(0) {
        errors.push(ValidationError::new("throttle.default_quotas.monthly_limit", "must be > 0"));
    }
    if th.priority_multipliers.is_empty() {
        errors.push(ValidationError::new("throttle.priority_multipliers", "must not be empty"));
    }
    for row in &th.priority_multipliers {
        if !(1..=10).contains(&row.priority) {
            errors.push(ValidationError::new(
                "throttle.priority_multipliers",
                format!("priority {} outside 1-10", row.priority),
            ));
        }
        if !(row.multiplier.is_finite() && row.multiplier >= 0.0) {
            errors.push(ValidationError::new(
                "throttle.priority_multipliers",
                format!("multiplier for priority {} must be a non-negative number", row.priority),
            ));
        }
    }
    if th.usage_sync_interval_secs == 0 {
        errors.push(ValidationError::new("throttle.usage_sync_interval_secs", "must be > 0"));
    }

    let ft = &config.fault_tolerance;
    check_breaker(&mut errors, "fault_tolerance.breaker", &ft.breaker);
    for name in ft.resources.keys() {
        check_breaker(
            &mut errors,
            &format!("fault_tolerance.resources.{}", name),
            &ft.breaker_for(name),
        );
        if ft.operation_timeout_for(name).is_zero() {
            errors.push(ValidationError::new(
                format!("fault_tolerance.resources.{}.operation_timeout_ms", name),
                "must be > 0",
            ));
        }
    }
    if ft.execution.operation_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "fault_tolerance.execution.operation_timeout_ms",
            "must be > 0",
        ));
    }
    if ft.execution.max_concurrent == 0 {
        errors.push(ValidationError::new("fault_tolerance.execution.max_concurrent", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{}' is not a socket address", value)));
    }
}

fn check_limits(errors: &mut Vec<ValidationError>, field: &str, limits: &WindowLimits) {
    if limits.requests_per_minute == 0 {
        errors.push(ValidationError::new(format!("{}.requests_per_minute", field), "must be > 0"));
    }
    if limits.requests_per_hour == 0 {
        errors.push(ValidationError::new(format!("{}.requests_per_hour", field), "must be > 0"));
    }
}

fn check_breaker(errors: &mut Vec<ValidationError>, field: &str, breaker: &BreakerConfig) {
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.failure_threshold", field), "must be > 0"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.success_threshold", field), "must be > 0"));
    }
    if breaker.max_recovery_timeout_ms < breaker.recovery_timeout_ms {
        errors.push(ValidationError::new(
            format!("{}.max_recovery_timeout_ms", field),
            "must be >= recovery_timeout_ms",
        ));
    }
    if breaker.max_call_history == 0 || breaker.max_transition_history == 0 {
        errors.push(ValidationError::new(
            format!("{}.max_*_history", field),
            "history sizes must be > 0",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ResourceOverride;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatekeeperConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GatekeeperConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.rate_limit.ip_limits.requests_per_minute = 0;
        config.throttle.delay.min_ms = 10_000;
        config.throttle.delay.threshold_percent = 100.0;
        config.rate_limit.trusted_proxies = vec!["10.0.0.0/8".into(), "bogus".into()];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"rate_limit.ip_limits.requests_per_minute"));
        assert!(fields.contains(&"throttle.delay"));
        assert!(fields.contains(&"throttle.delay.threshold_percent"));
        assert!(fields.contains(&"rate_limit.trusted_proxies[1]"));
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_resource_override_is_validated_after_merge() {
        let mut config = GatekeeperConfig::default();
        config.fault_tolerance.resources.insert(
            "flaky".into(),
            ResourceOverride {
                failure_threshold: Some(0),
                ..Default::default()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "fault_tolerance.resources.flaky.failure_threshold");
    }
}
