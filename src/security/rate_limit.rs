//! Fixed-window rate limiting on client IP and credential.
//!
//! # Responsibilities
//! - Count requests per (scope, granularity, window, identity) in the counter store
//! - Deny when the minute or hour count of either scope exceeds its limit
//! - Report limit/remaining/reset for response headers
//!
//! # Design Decisions
//! - Minute and hour counters of one scope move in a single atomic increment
//! - A denied request stays counted; nothing is rolled back
//! - The IP scope is checked first; a credential is only counted once its IP passes
//! - Fail open: a missing or failing store admits the request and logs a warning
//! - Fixed windows allow up to twice the nominal rate across a boundary

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::config::{RateLimitConfig, WindowLimits};
use crate::error::Rejection;
use crate::observability::metrics;
use crate::store::{self, Clock, CounterIncrement, CounterStore, StoreError, SystemClock};

/// Upper bound on one counter store round trip.
pub const STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Who a counter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Ip,
    Credential,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Ip => "ip",
            LimitScope::Credential => "credential",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
        }
    }

    fn key_tag(&self) -> &'static str {
        match self {
            Granularity::Minute => "min",
            Granularity::Hour => "hr",
        }
    }

    /// Index of the window containing `now`.
    pub fn window_index(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.seconds())
    }

    /// Start of the window after the one containing `now`.
    pub fn next_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = (self.window_index(now) + 1) * self.seconds();
        Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
        })
    }
}

/// Counter key for one window.
pub fn window_key(
    scope: LimitScope,
    granularity: Granularity,
    now: DateTime<Utc>,
    identity: &str,
) -> String {
    format!(
        "ratelimit:{}:{}:{}:{}",
        scope.as_str(),
        granularity.key_tag(),
        granularity.window_index(now),
        identity
    )
}

/// True if `path` equals an entry or lies under it (`entry/...`).
pub fn is_excluded_path(path: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|entry| {
        let entry = entry.trim_end_matches('/');
        if entry.is_empty() {
            return path == "/";
        }
        path == entry
            || path
                .strip_prefix(entry)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Set when the request is denied.
    pub rejection: Option<Rejection>,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.rejection.is_none()
    }

    fn allow(limit: u64, used: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(used),
            reset_at,
            rejection: None,
        }
    }
}

struct WindowCount {
    granularity: Granularity,
    limit: u64,
    used: u64,
    reset_at: DateTime<Utc>,
}

enum ScopeOutcome {
    /// Minute window usage, for headers.
    Passed(WindowCount),
    Denied(RateLimitDecision),
}

/// Fixed-window limiter over a shared counter store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// `store = None` runs the limiter fail-open: every request is admitted.
    pub fn new(config: RateLimitConfig, store: Option<Arc<dyn CounterStore>>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RateLimitConfig,
        store: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if store.is_none() && config.enabled {
            tracing::warn!("Rate limiter has no counter store; requests will not be limited");
        }
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        is_excluded_path(path, &self.config.exclude_paths)
    }

    /// Count this request against the IP and, if present, the credential.
    pub async fn check_and_increment(
        &self,
        ip: &str,
        credential: Option<&str>,
    ) -> RateLimitDecision {
        let now = self.clock.now();

        let Some(store) = self.store.as_deref() else {
            return self.fail_open(now, credential.is_some());
        };

        let ip_minute = match self
            .check_scope(store, LimitScope::Ip, ip, self.config.ip_limits, now)
            .await
        {
            Ok(ScopeOutcome::Passed(minute)) => minute,
            Ok(ScopeOutcome::Denied(decision)) => return decision,
            Err(e) => return self.store_failed(e, now, credential.is_some()),
        };

        let Some(credential) = credential else {
            return RateLimitDecision::allow(ip_minute.limit, ip_minute.used, ip_minute.reset_at);
        };

        match self
            .check_scope(
                store,
                LimitScope::Credential,
                credential,
                self.config.credential_limits,
                now,
            )
            .await
        {
            Ok(ScopeOutcome::Passed(minute)) => {
                RateLimitDecision::allow(minute.limit, minute.used, minute.reset_at)
            }
            Ok(ScopeOutcome::Denied(decision)) => decision,
            Err(e) => self.store_failed(e, now, true),
        }
    }

    async fn check_scope(
        &self,
        store: &dyn CounterStore,
        scope: LimitScope,
        identity: &str,
        limits: WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<ScopeOutcome, StoreError> {
        let windows = [
            (Granularity::Minute, limits.requests_per_minute),
            (Granularity::Hour, limits.requests_per_hour),
        ];
        let increments: Vec<CounterIncrement> = windows
            .iter()
            .map(|(g, _)| {
                CounterIncrement::new(
                    window_key(scope, *g, now, identity),
                    Duration::from_secs(g.seconds() as u64),
                )
            })
            .collect();

        let counts = store::with_timeout(STORE_TIMEOUT, store.increment(&increments)).await?;

        let mut minute = None;
        for ((granularity, limit), used) in windows.into_iter().zip(counts) {
            let reset_at = granularity.next_window_start(now);
            if used > limit {
                tracing::warn!(
                    scope = %scope,
                    window = %granularity,
                    identity = %redact(identity, scope),
                    used,
                    limit,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited(scope.as_str());
                return Ok(ScopeOutcome::Denied(RateLimitDecision {
                    limit,
                    remaining: 0,
                    reset_at,
                    rejection: Some(Rejection::AdmissionDenied {
                        scope,
                        granularity,
                        limit,
                        reset_at,
                    }),
                }));
            }
            if minute.is_none() {
                minute = Some(WindowCount {
                    granularity,
                    limit,
                    used,
                    reset_at,
                });
            }
        }

        minute
            .filter(|m| m.granularity == Granularity::Minute)
            .map(ScopeOutcome::Passed)
            .ok_or_else(|| StoreError::Unavailable("counter store returned no values".into()))
    }

    fn fail_open(&self, now: DateTime<Utc>, has_credential: bool) -> RateLimitDecision {
        let limit = if has_credential {
            self.config.credential_limits.requests_per_minute
        } else {
            self.config.ip_limits.requests_per_minute
        };
        RateLimitDecision::allow(limit, 0, Granularity::Minute.next_window_start(now))
    }

    fn store_failed(
        &self,
        error: StoreError,
        now: DateTime<Utc>,
        has_credential: bool,
    ) -> RateLimitDecision {
        tracing::warn!(error = %error, "Rate limit check failed, allowing request");
        metrics::record_store_error("rate_limit");
        self.fail_open(now, has_credential)
    }
}

/// Credentials are logged by prefix only.
pub fn redact(identity: &str, scope: LimitScope) -> String {
    match scope {
        LimitScope::Ip => identity.to_string(),
        LimitScope::Credential => credential_prefix(identity),
    }
}

/// First 8 characters of a credential, for logs.
pub fn credential_prefix(credential: &str) -> String {
    let prefix: String = credential.chars().take(8).collect();
    if prefix.len() < credential.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ManualClock, MemoryCounterStore};
    use async_trait::async_trait;

    fn build(ip: (u64, u64), credential: (u64, u64)) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 30, 10).unwrap(),
        ));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let config = RateLimitConfig {
            ip_limits: WindowLimits {
                requests_per_minute: ip.0,
                requests_per_hour: ip.1,
            },
            credential_limits: WindowLimits {
                requests_per_minute: credential.0,
                requests_per_hour: credential.1,
            },
            ..RateLimitConfig::default()
        };
        (clock.clone(), RateLimiter::with_clock(config, Some(store), clock))
    }

    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &[CounterIncrement]) -> Result<Vec<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: u64, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &[String]) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<(String, u64)>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_window_keys_and_reset() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 12, 30, 10).unwrap();
        let minute = Granularity::Minute.window_index(now);
        assert_eq!(
            window_key(LimitScope::Ip, Granularity::Minute, now, "1.2.3.4"),
            format!("ratelimit:ip:min:{minute}:1.2.3.4")
        );
        assert_eq!(
            Granularity::Minute.next_window_start(now),
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 31, 0).unwrap()
        );
        assert_eq!(
            Granularity::Hour.next_window_start(now),
            Utc.with_ymd_and_hms(2026, 5, 4, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_excluded_paths() {
        let excluded = vec!["/health".to_string(), "/static/".to_string()];
        assert!(is_excluded_path("/health", &excluded));
        assert!(is_excluded_path("/health/live", &excluded));
        assert!(!is_excluded_path("/healthz", &excluded));
        assert!(is_excluded_path("/static/app.js", &excluded));
        assert!(!is_excluded_path("/api/v1", &excluded));
    }

    #[tokio::test]
    async fn test_limit_then_deny_then_next_window() {
        let (clock, limiter) = build((3, 100), (100, 1000));
        for expected_remaining in [2, 1, 0] {
            let d = limiter.check_and_increment("10.0.0.1", None).await;
            assert!(d.is_allowed());
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = limiter.check_and_increment("10.0.0.1", None).await;
        assert!(!denied.is_allowed());

        // Other clients are unaffected.
        assert!(limiter.check_and_increment("10.0.0.2", None).await.is_allowed());

        clock.advance(Duration::from_secs(50));
        assert!(limiter.check_and_increment("10.0.0.1", None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_two_per_minute_scenario() {
        let (_clock, limiter) = build((2, 100), (100, 1000));
        let a = limiter.check_and_increment("10.0.0.1", None).await;
        let b = limiter.check_and_increment("10.0.0.1", None).await;
        let c = limiter.check_and_increment("10.0.0.1", None).await;

        assert_eq!((a.remaining, b.remaining), (1, 0));
        assert!(a.is_allowed() && b.is_allowed());
        assert_eq!(c.remaining, 0);
        assert_eq!(c.reset_at, Utc.with_ymd_and_hms(2026, 5, 4, 12, 31, 0).unwrap());
        assert!(matches!(
            c.rejection,
            Some(Rejection::AdmissionDenied {
                scope: LimitScope::Ip,
                granularity: Granularity::Minute,
                limit: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_hour_limit_and_credential_scope() {
        let (clock, limiter) = build((100, 3), (100, 1000));
        for _ in 0..3 {
            assert!(limiter.check_and_increment("10.0.0.1", None).await.is_allowed());
            clock.advance(Duration::from_secs(60));
        }
        let denied = limiter.check_and_increment("10.0.0.1", None).await;
        match denied.rejection {
            Some(Rejection::AdmissionDenied { granularity, .. }) => {
                assert_eq!(granularity, Granularity::Hour)
            }
            other => panic!("expected hour denial, got {other:?}"),
        }

        let (_clock, limiter) = build((100, 1000), (1, 100));
        let first = limiter.check_and_increment("10.0.0.1", Some("key-123")).await;
        assert!(first.is_allowed());
        assert_eq!((first.limit, first.remaining), (1, 0));
        let second = limiter.check_and_increment("10.0.0.9", Some("key-123")).await;
        assert!(matches!(
            second.rejection,
            Some(Rejection::AdmissionDenied {
                scope: LimitScope::Credential,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fails_open_without_or_with_broken_store() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), None);
        for _ in 0..500 {
            assert!(limiter.check_and_increment("10.0.0.1", None).await.is_allowed());
        }

        let limiter = RateLimiter::new(RateLimitConfig::default(), Some(Arc::new(DownStore)));
        let d = limiter.check_and_increment("10.0.0.1", Some("key")).await;
        assert!(d.is_allowed());
        assert_eq!(d.limit, 120);
    }

    #[test]
    fn test_credential_prefix() {
        assert_eq!(credential_prefix("abcdefghijkl"), "abcdefgh...");
        assert_eq!(credential_prefix("short"), "short");
    }
}
