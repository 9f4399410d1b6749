//! Circuit breaker for resource protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: resource assumed down, calls are skipped
//! - Half-Open: probing whether the resource recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure policy trips (consecutive failures >= threshold by default)
//! Open → Half-Open: recovery timeout elapsed (checked lazily by is_open)
//! Open → Half-Open: a success is observed while open
//! Half-Open → Closed: success_threshold consecutive successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - One breaker per resource name; each owns its stats and histories
//! - State lives behind a short mutex; histories have their own locks
//! - Recovery timing and trip rules are injected policies, not subclasses
//! - Event handlers run after the state lock is released

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BreakerConfig;
use crate::observability::metrics;
use crate::resilience::backoff::recovery_backoff;
use crate::resilience::history::{BoundedHistory, CallRecord, Timestamped};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThresholdReached,
    FailureInHalfOpen,
    RecoveryTimeoutExpired,
    SuccessWhileOpen,
    SuccessThresholdReached,
    ManualReset,
    ForcedOpen,
    ForcedClose,
}

/// A state change kept in the transition history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateTransitionRecord {
    pub timestamp: Instant,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
}

impl Timestamped for StateTransitionRecord {
    fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Call counters for one breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Failures since the circuit last closed.
    pub failure_count: u64,
    /// Successes since the circuit last closed.
    pub success_count: u64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub timeout_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

/// Decides how long an open circuit waits before probing.
pub trait RecoveryPolicy: Send + Sync + fmt::Debug {
    /// `attempt` is the number of openings since the circuit was last closed (>= 1).
    fn recovery_timeout(&self, attempt: u32) -> Duration;
}

/// Always wait the same time.
#[derive(Debug, Clone, Copy)]
pub struct FixedRecovery(pub Duration);

impl RecoveryPolicy for FixedRecovery {
    fn recovery_timeout(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Double the wait on every re-opening, up to a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialRecovery {
    pub base: Duration,
    pub max: Duration,
}

impl RecoveryPolicy for ExponentialRecovery {
    fn recovery_timeout(&self, attempt: u32) -> Duration {
        recovery_backoff(attempt, self.base, self.max)
    }
}

/// Decides when a closed circuit trips.
pub trait FailurePolicy: Send + Sync + fmt::Debug {
    fn should_trip(
        &self,
        stats: &CircuitBreakerStats,
        calls: &BoundedHistory<CallRecord>,
        now: Instant,
    ) -> bool;
}

/// Trip after N consecutive failures.
#[derive(Debug, Clone, Copy)]
pub struct ConsecutiveFailures {
    pub threshold: u32,
}

impl FailurePolicy for ConsecutiveFailures {
    fn should_trip(
        &self,
        stats: &CircuitBreakerStats,
        _calls: &BoundedHistory<CallRecord>,
        _now: Instant,
    ) -> bool {
        stats.consecutive_failures >= u64::from(self.threshold)
    }
}

/// Trip after N failures inside a sliding window of call history.
#[derive(Debug, Clone, Copy)]
pub struct FailuresInWindow {
    pub threshold: u32,
    pub window: Duration,
}

impl FailurePolicy for FailuresInWindow {
    fn should_trip(
        &self,
        _stats: &CircuitBreakerStats,
        calls: &BoundedHistory<CallRecord>,
        now: Instant,
    ) -> bool {
        let since = now.checked_sub(self.window).unwrap_or(now);
        calls.count_since(since, |c| !c.success) >= self.threshold as usize
    }
}

/// Notified after a breaker changes state.
pub trait BreakerEventHandler: Send + Sync {
    fn on_open(&self, _status: &BreakerStatus, _reason: TransitionReason) {}
    fn on_close(&self, _status: &BreakerStatus) {}
    fn on_half_open(&self, _status: &BreakerStatus) {}
    fn on_reset(&self, _status: &BreakerStatus) {}
}

/// Logs transitions and counts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

impl BreakerEventHandler for LoggingEventHandler {
    fn on_open(&self, status: &BreakerStatus, reason: TransitionReason) {
        tracing::warn!(
            resource = %status.resource,
            reason = ?reason,
            recovery_attempts = status.backoff.recovery_attempts,
            next_timeout_ms = status.backoff.current_timeout_ms,
            "Circuit breaker OPENED"
        );
        metrics::record_breaker_transition(&status.resource, CircuitState::Open);
    }

    fn on_close(&self, status: &BreakerStatus) {
        tracing::info!(resource = %status.resource, "Circuit breaker CLOSED");
        metrics::record_breaker_transition(&status.resource, CircuitState::Closed);
    }

    fn on_half_open(&self, status: &BreakerStatus) {
        tracing::info!(resource = %status.resource, "Circuit breaker HALF-OPEN");
        metrics::record_breaker_transition(&status.resource, CircuitState::HalfOpen);
    }

    fn on_reset(&self, status: &BreakerStatus) {
        tracing::info!(resource = %status.resource, "Circuit breaker RESET");
    }
}

/// History sizes and cleanup bookkeeping.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryUsage {
    pub call_history_size: usize,
    pub state_transitions_size: usize,
    pub max_call_history: usize,
    pub max_transition_history: usize,
    pub last_cleanup_secs_ago: u64,
    pub cleanup_interval_secs: u64,
    pub retention_period_secs: u64,
}

/// Recovery backoff bookkeeping.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackoffStatus {
    pub enabled: bool,
    pub recovery_attempts: u32,
    pub current_timeout_ms: u64,
    pub base_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

/// A recent transition, as reported by status.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransitionView {
    pub age_ms: u64,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub resource: String,
    pub state: CircuitState,
    pub time_in_state_ms: u64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
    pub stats: CircuitBreakerStats,
    pub config: BreakerConfig,
    pub memory: MemoryUsage,
    pub backoff: BackoffStatus,
    pub recent_transitions: Vec<TransitionView>,
}

/// Records removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub calls_removed: usize,
    pub transitions_removed: usize,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    stats: CircuitBreakerStats,
    state_changed_at: Instant,
    last_cleanup: Instant,
    recovery_attempts: u32,
    current_recovery_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
struct TransitionEvent {
    to: CircuitState,
    reason: TransitionReason,
}

const RECENT_TRANSITIONS: usize = 10;

/// Per-resource circuit breaker.
pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    calls: BoundedHistory<CallRecord>,
    transitions: BoundedHistory<StateTransitionRecord>,
    recovery: Box<dyn RecoveryPolicy>,
    failure_policy: Box<dyn FailurePolicy>,
    events: Arc<dyn BreakerEventHandler>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("resource", &self.resource)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker whose policies follow `config`.
    pub fn new(resource: impl Into<String>, config: BreakerConfig) -> Self {
        let recovery: Box<dyn RecoveryPolicy> = if config.exponential_backoff {
            Box::new(ExponentialRecovery {
                base: config.recovery_timeout(),
                max: config.max_recovery_timeout(),
            })
        } else {
            Box::new(FixedRecovery(config.recovery_timeout()))
        };
        let failure_policy: Box<dyn FailurePolicy> = match config.failure_window() {
            Some(window) => Box::new(FailuresInWindow {
                threshold: config.failure_threshold,
                window,
            }),
            None => Box::new(ConsecutiveFailures {
                threshold: config.failure_threshold,
            }),
        };

        let now = Instant::now();
        Self {
            resource: resource.into(),
            calls: BoundedHistory::new(config.max_call_history, config.retention_period()),
            transitions: BoundedHistory::new(
                config.max_transition_history,
                config.retention_period(),
            ),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: CircuitBreakerStats::default(),
                state_changed_at: now,
                last_cleanup: now,
                recovery_attempts: 0,
                current_recovery_timeout: config.recovery_timeout(),
            }),
            recovery,
            failure_policy,
            events: Arc::new(LoggingEventHandler),
            config,
        }
    }

    pub fn with_recovery_policy(mut self, policy: impl RecoveryPolicy + 'static) -> Self {
        self.recovery = Box::new(policy);
        self
    }

    pub fn with_failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Box::new(policy);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn BreakerEventHandler>) -> Self {
        self.events = handler;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, without the lazy half-open check.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// True if calls should be skipped. An open circuit whose recovery timeout has
    /// elapsed moves to half-open here and reports false.
    pub fn is_open(&self) -> bool {
        let event = {
            let mut inner = self.lock();
            if inner.state != CircuitState::Open {
                return false;
            }
            if inner.state_changed_at.elapsed() < inner.current_recovery_timeout {
                return true;
            }
            self.transition(
                &mut inner,
                CircuitState::HalfOpen,
                TransitionReason::RecoveryTimeoutExpired,
            )
        };
        self.emit(event);
        false
    }

    /// Convenience inverse of [`is_open`](Self::is_open).
    pub fn can_execute(&self) -> bool {
        !self.is_open()
    }

    /// Record a successful call.
    pub fn record_success(&self, execution_time: Duration) {
        let now = Instant::now();
        self.calls.push(CallRecord {
            timestamp: now,
            success: true,
            execution_time,
        });

        let event = {
            let mut inner = self.lock();
            let stats = &mut inner.stats;
            stats.success_count += 1;
            stats.total_successes += 1;
            stats.total_calls += 1;
            stats.consecutive_successes += 1;
            stats.consecutive_failures = 0;
            stats.last_success_time = Some(Utc::now());

            match inner.state {
                CircuitState::HalfOpen
                    if inner.stats.consecutive_successes
                        >= u64::from(self.config.success_threshold) =>
                {
                    Some(self.transition(
                        &mut inner,
                        CircuitState::Closed,
                        TransitionReason::SuccessThresholdReached,
                    ))
                }
                CircuitState::Open => Some(self.transition(
                    &mut inner,
                    CircuitState::HalfOpen,
                    TransitionReason::SuccessWhileOpen,
                )),
                _ => None,
            }
        };

        self.maybe_cleanup();
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Record a failed call. Timeouts count as failures and are also tallied separately.
    pub fn record_failure(&self, execution_time: Duration, is_timeout: bool) {
        let now = Instant::now();
        self.calls.push(CallRecord {
            timestamp: now,
            success: false,
            execution_time,
        });

        let event = {
            let mut inner = self.lock();
            let stats = &mut inner.stats;
            stats.failure_count += 1;
            stats.total_failures += 1;
            stats.total_calls += 1;
            stats.consecutive_failures += 1;
            stats.consecutive_successes = 0;
            stats.last_failure_time = Some(Utc::now());
            if is_timeout {
                stats.timeout_calls += 1;
            }

            match inner.state {
                CircuitState::Closed
                    if self.failure_policy.should_trip(&inner.stats, &self.calls, now) =>
                {
                    Some(self.transition(
                        &mut inner,
                        CircuitState::Open,
                        TransitionReason::FailureThresholdReached,
                    ))
                }
                CircuitState::HalfOpen => Some(self.transition(
                    &mut inner,
                    CircuitState::Open,
                    TransitionReason::FailureInHalfOpen,
                )),
                _ => None,
            }
        };

        self.maybe_cleanup();
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Apply a transition under the state lock and record it.
    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitState,
        reason: TransitionReason,
    ) -> TransitionEvent {
        let now = Instant::now();
        let from = inner.state;
        inner.state = to;
        inner.state_changed_at = now;

        match to {
            CircuitState::Open => {
                inner.recovery_attempts = inner.recovery_attempts.saturating_add(1);
                inner.current_recovery_timeout =
                    self.recovery.recovery_timeout(inner.recovery_attempts);
            }
            CircuitState::HalfOpen => {
                inner.stats.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                inner.stats.consecutive_failures = 0;
                inner.stats.consecutive_successes = 0;
                inner.stats.failure_count = 0;
                inner.stats.success_count = 0;
                inner.recovery_attempts = 0;
                inner.current_recovery_timeout = self.config.recovery_timeout();
            }
        }

        self.transitions.push(StateTransitionRecord {
            timestamp: now,
            from,
            to,
            reason,
        });

        TransitionEvent { to, reason }
    }

    fn emit(&self, event: TransitionEvent) {
        let status = self.status();
        match (event.to, event.reason) {
            (_, TransitionReason::ManualReset) => self.events.on_reset(&status),
            (CircuitState::Open, reason) => self.events.on_open(&status, reason),
            (CircuitState::Closed, _) => self.events.on_close(&status),
            (CircuitState::HalfOpen, _) => self.events.on_half_open(&status),
        }
    }

    /// Run a cleanup if `cleanup_interval` has passed since the last one.
    pub fn maybe_cleanup(&self) -> Option<CleanupReport> {
        let now = Instant::now();
        {
            let mut inner = self.lock();
            if now.saturating_duration_since(inner.last_cleanup) < self.config.cleanup_interval() {
                return None;
            }
            // Claim the run so concurrent recorders do not repeat it.
            inner.last_cleanup = now;
        }
        let report = self.cleanup_histories(now);
        if report.calls_removed > 0 || report.transitions_removed > 0 {
            tracing::debug!(
                resource = %self.resource,
                calls_removed = report.calls_removed,
                transitions_removed = report.transitions_removed,
                "Circuit breaker history cleanup"
            );
        }
        Some(report)
    }

    /// Drop aged records and trim both histories now.
    pub fn force_cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        self.lock().last_cleanup = now;
        let report = self.cleanup_histories(now);
        tracing::info!(
            resource = %self.resource,
            calls_removed = report.calls_removed,
            transitions_removed = report.transitions_removed,
            "Circuit breaker forced cleanup"
        );
        report
    }

    fn cleanup_histories(&self, now: Instant) -> CleanupReport {
        CleanupReport {
            calls_removed: self.calls.cleanup(now),
            transitions_removed: self.transitions.cleanup(now),
        }
    }

    /// Back to closed with fresh stats and empty histories.
    pub fn reset(&self) {
        let event = {
            let mut inner = self.lock();
            self.calls.clear();
            self.transitions.clear();
            inner.stats = CircuitBreakerStats::default();
            inner.last_cleanup = Instant::now();
            self.transition(&mut inner, CircuitState::Closed, TransitionReason::ManualReset)
        };
        self.emit(event);
    }

    /// Open the circuit regardless of stats.
    pub fn force_open(&self) {
        let event = {
            let mut inner = self.lock();
            self.transition(&mut inner, CircuitState::Open, TransitionReason::ForcedOpen)
        };
        self.emit(event);
    }

    /// Close the circuit regardless of stats.
    pub fn force_close(&self) {
        let event = {
            let mut inner = self.lock();
            self.transition(&mut inner, CircuitState::Closed, TransitionReason::ForcedClose)
        };
        self.emit(event);
    }

    /// History sizes without walking the records.
    pub fn memory_usage(&self) -> MemoryUsage {
        let last_cleanup = self.lock().last_cleanup;
        MemoryUsage {
            call_history_size: self.calls.len(),
            state_transitions_size: self.transitions.len(),
            max_call_history: self.calls.max_size(),
            max_transition_history: self.transitions.max_size(),
            last_cleanup_secs_ago: last_cleanup.elapsed().as_secs(),
            cleanup_interval_secs: self.config.cleanup_interval_secs,
            retention_period_secs: self.config.retention_period_secs,
        }
    }

    /// Transition history, oldest first.
    pub fn transitions(&self) -> Vec<StateTransitionRecord> {
        self.transitions.snapshot()
    }

    /// Snapshot of state, stats, config and memory usage.
    pub fn status(&self) -> BreakerStatus {
        let (state, stats, time_in_state, attempts, current_timeout) = {
            let inner = self.lock();
            (
                inner.state,
                inner.stats.clone(),
                inner.state_changed_at.elapsed(),
                inner.recovery_attempts,
                inner.current_recovery_timeout,
            )
        };

        let success_rate = if stats.total_calls > 0 {
            stats.total_successes as f64 / stats.total_calls as f64
        } else {
            0.0
        };
        let (count, total) = self.calls.fold((0u64, Duration::ZERO), |(n, sum), c| {
            (n + 1, sum + c.execution_time)
        });
        let avg_execution_time_ms = if count > 0 {
            total.as_secs_f64() * 1000.0 / count as f64
        } else {
            0.0
        };

        let now = Instant::now();
        let recent_transitions = self
            .transitions
            .recent(RECENT_TRANSITIONS)
            .into_iter()
            .map(|t| TransitionView {
                age_ms: now.saturating_duration_since(t.timestamp).as_millis() as u64,
                from: t.from,
                to: t.to,
                reason: t.reason,
            })
            .collect();

        BreakerStatus {
            resource: self.resource.clone(),
            state,
            time_in_state_ms: time_in_state.as_millis() as u64,
            success_rate,
            avg_execution_time_ms,
            stats,
            config: self.config.clone(),
            memory: self.memory_usage(),
            backoff: BackoffStatus {
                enabled: self.config.exponential_backoff,
                recovery_attempts: attempts,
                current_timeout_ms: current_timeout.as_millis() as u64,
                base_timeout_ms: self.config.recovery_timeout_ms,
                max_timeout_ms: self.config.max_recovery_timeout_ms,
            },
            recent_transitions,
        }
    }
}
