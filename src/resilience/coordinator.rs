//! Execution coordinator.
//!
//! # Responsibilities
//! - Run one operation against many named resources concurrently
//! - Skip resources whose breaker is open, without calling them
//! - Apply a per-resource timeout and record every outcome on that resource's breaker
//! - Drain in-flight executions on shutdown
//!
//! # Design Decisions
//! - Each call runs in its own task: a panic or a hang in one resource surfaces as
//!   that resource's failure or timeout and never touches its siblings
//! - Timed-out calls are aborted, so aggregate wall time tracks the slowest timeout
//! - `max_concurrent` bounds calls in flight within one execution; time spent
//!   queued for a slot counts against the resource's timeout

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{Notify, Semaphore};
use tokio::time;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::{BoxError, ResourceError};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerStatus, CleanupReport};
use crate::resilience::registry::{BreakerRegistry, HealthSummary, MemoryUsageSummary};

/// Per-execution identifiers handed to every resource call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub request_id: String,
    pub trace_id: String,
    pub credential: Option<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            credential: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// What one resource produced.
#[derive(Debug)]
pub struct ResourceOutcome<T> {
    pub result: Result<T, ResourceError>,
    /// Zero when the call was skipped.
    pub execution_time: Duration,
}

impl<T> ResourceOutcome<T> {
    fn skipped(error: ResourceError) -> Self {
        Self {
            result: Err(error),
            execution_time: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Dispatches operations to resources through their breakers.
#[derive(Debug)]
pub struct ExecutionCoordinator {
    registry: Arc<BreakerRegistry>,
    config: ExecutionConfig,
    shutting_down: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
}

struct InFlight<'a>(&'a ExecutionCoordinator);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        let config = registry.config().execution.clone();
        Self {
            registry,
            config,
            shutting_down: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    /// Executions currently running.
    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Invoke `operation` for every resource and collect one outcome per name.
    ///
    /// `operation` receives the resource name and the context; the future it returns
    /// is spawned, so it must own its data.
    pub async fn execute<T, F, Fut, I>(
        &self,
        ctx: &ExecutionContext,
        resources: I,
        operation: F,
    ) -> HashMap<String, ResourceOutcome<T>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: Fn(String, ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut names: Vec<String> = resources
            .into_iter()
            .map(|r| r.as_ref().to_string())
            .collect();
        names.sort();
        names.dedup();

        let mut results = HashMap::with_capacity(names.len());

        if self.is_shutting_down() {
            for name in names {
                metrics::record_resource_call(&name, "shutting_down");
                results.insert(name, ResourceOutcome::skipped(ResourceError::ShuttingDown));
            }
            return results;
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        let _in_flight = InFlight(self);

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut calls = Vec::with_capacity(names.len());

        for name in names {
            let breaker = self.registry.get_or_create(&name);
            if breaker.is_open() {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    resource = %name,
                    "Resource skipped, circuit open"
                );
                metrics::record_resource_call(&name, "circuit_open");
                let outcome = ResourceOutcome::skipped(ResourceError::CircuitOpen {
                    resource: name.clone(),
                });
                results.insert(name, outcome);
                continue;
            }

            let timeout = self.registry.operation_timeout(&name);
            // Waiting for a permit counts against the timeout.
            let deadline = time::Instant::now() + timeout;
            let call = operation(name.clone(), ctx.clone());
            let permits = permits.clone();
            let request_id = ctx.request_id.clone();

            calls.push(async move {
                let start = Instant::now();
                let result = match time::timeout_at(deadline, permits.acquire_owned()).await {
                    Ok(permit) => {
                        // The semaphore is never closed.
                        let _permit = permit.ok();
                        let started = Instant::now();
                        let mut handle = tokio::spawn(call);

                        match time::timeout_at(deadline, &mut handle).await {
                            Ok(Ok(Ok(value))) => {
                                breaker.record_success(started.elapsed());
                                Ok(value)
                            }
                            Ok(Ok(Err(source))) => {
                                breaker.record_failure(started.elapsed(), false);
                                Err(ResourceError::Failure { source })
                            }
                            Ok(Err(join_error)) => {
                                breaker.record_failure(started.elapsed(), false);
                                Err(ResourceError::Failure {
                                    source: Box::new(join_error),
                                })
                            }
                            Err(_) => {
                                handle.abort();
                                breaker.record_failure(started.elapsed(), true);
                                Err(ResourceError::Timeout { after: timeout })
                            }
                        }
                    }
                    // Never started, so the breaker is not charged.
                    Err(_) => Err(ResourceError::Timeout { after: timeout }),
                };

                let execution_time = start.elapsed();
                match &result {
                    Ok(_) => metrics::record_resource_call(&name, "success"),
                    Err(e) => {
                        tracing::warn!(
                            request_id = %request_id,
                            resource = %name,
                            error = %e,
                            elapsed_ms = execution_time.as_millis() as u64,
                            "Resource call failed"
                        );
                        metrics::record_resource_call(&name, e.kind());
                    }
                }

                (
                    name,
                    ResourceOutcome {
                        result,
                        execution_time,
                    },
                )
            });
        }

        results.extend(join_all(calls).await);
        results
    }

    /// Refuse new executions and wait up to `timeout` for running ones.
    /// Returns true if everything drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutting_down.store(true, Ordering::Release);
        tracing::info!(
            active = self.active_executions(),
            "Execution coordinator shutting down"
        );

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.idle.notified();
                if self.active_executions() == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                active = self.active_executions(),
                "Shutdown timeout reached with executions in flight"
            );
        }
        drained
    }

    /// Shutdown with the configured drain timeout.
    pub async fn shutdown_default(&self) -> bool {
        self.shutdown(Duration::from_secs(self.config.shutdown_timeout_secs))
            .await
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.registry.health_summary()
    }

    pub fn memory_usage_summary(&self) -> MemoryUsageSummary {
        self.registry.memory_usage_summary()
    }

    pub fn force_cleanup_all(&self) -> std::collections::BTreeMap<String, CleanupReport> {
        self.registry.force_cleanup_all()
    }

    pub fn reset_breaker(&self, resource: &str) -> bool {
        self.registry.reset(resource)
    }

    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.registry.statuses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FaultToleranceConfig, ResourceOverride};
    use crate::resilience::CircuitState;

    fn coordinator(max_concurrent: usize) -> ExecutionCoordinator {
        let mut config = FaultToleranceConfig::default();
        config.execution.operation_timeout_ms = 200;
        config.execution.max_concurrent = max_concurrent;
        config.breaker.failure_threshold = 2;
        config.resources.insert(
            "slow".to_string(),
            ResourceOverride {
                operation_timeout_ms: Some(100),
                ..ResourceOverride::default()
            },
        );
        ExecutionCoordinator::new(Arc::new(BreakerRegistry::new(config)))
    }

    async fn mixed_operation(name: String, _ctx: ExecutionContext) -> Result<String, BoxError> {
        match name.as_str() {
            "slow" => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("late".to_string())
            }
            "broken" => Err("connection refused".into()),
            _ => Ok(format!("{name}: ok")),
        }
    }

    #[tokio::test]
    async fn test_timeout_failure_success_are_isolated() {
        let coordinator = coordinator(10);
        let ctx = ExecutionContext::new();
        let start = Instant::now();

        let results = coordinator
            .execute(&ctx, ["slow", "broken", "fast"], |name, ctx| {
                mixed_operation(name, ctx)
            })
            .await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            results["slow"].result,
            Err(ResourceError::Timeout { after }) if after == Duration::from_millis(100)
        ));
        match &results["broken"].result {
            Err(ResourceError::Failure { source }) => {
                assert_eq!(source.to_string(), "connection refused")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(results["fast"].result.as_deref().unwrap(), "fast: ok");

        let registry = coordinator.registry();
        assert_eq!(registry.get("slow").unwrap().status().stats.timeout_calls, 1);
        assert_eq!(registry.get("broken").unwrap().status().stats.total_failures, 1);
        assert_eq!(registry.get("fast").unwrap().status().stats.total_successes, 1);
    }

    #[tokio::test]
    async fn test_wall_time_is_max_not_sum() {
        let coordinator = coordinator(10);
        let ctx = ExecutionContext::new();
        let start = Instant::now();

        let results = coordinator
            .execute(&ctx, ["a", "b", "c"], |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>(())
            })
            .await;

        // Three 200ms timeouts run side by side.
        assert!(start.elapsed() < Duration::from_millis(550));
        assert!(results.values().all(|o| matches!(o.result, Err(ResourceError::Timeout { .. }))));
    }

    #[tokio::test]
    async fn test_queued_calls_share_the_timeout_budget() {
        let coordinator = coordinator(1);
        let ctx = ExecutionContext::new();
        let start = Instant::now();

        let results = coordinator
            .execute(&ctx, ["a", "b", "c", "d"], |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>(())
            })
            .await;

        // One slot and four 200ms timeouts still finish together.
        assert!(start.elapsed() < Duration::from_millis(550));
        assert_eq!(results.len(), 4);
        assert!(results.values().all(|o| matches!(o.result, Err(ResourceError::Timeout { .. }))));

        let charged: u64 = ["a", "b", "c", "d"]
            .iter()
            .map(|name| coordinator.registry().get(name).unwrap().status().stats.timeout_calls)
            .sum();
        assert!((1..4).contains(&charged));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_call() {
        let coordinator = coordinator(10);
        let ctx = ExecutionContext::new();
        for _ in 0..2 {
            coordinator
                .execute(&ctx, ["broken"], |name, ctx| mixed_operation(name, ctx))
                .await;
        }
        let breaker = coordinator.registry().get("broken").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let results = coordinator
            .execute(&ctx, ["broken"], move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(results["broken"].result, Err(ResourceError::CircuitOpen { .. })));
        assert_eq!(results["broken"].execution_time, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_a_failure() {
        let coordinator = coordinator(10);
        let ctx = ExecutionContext::new();
        let results = coordinator
            .execute(&ctx, ["bad", "good"], |name, _| async move {
                if name == "bad" {
                    panic!("adapter bug");
                }
                Ok::<_, BoxError>(1)
            })
            .await;

        assert!(matches!(results["bad"].result, Err(ResourceError::Failure { .. })));
        assert_eq!(*results["good"].result.as_ref().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_concurrent_limits_parallel_calls() {
        let coordinator = coordinator(2);
        let ctx = ExecutionContext::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let results = coordinator
            .execute(&ctx, ["a", "b", "c", "d", "e"], move |_, _| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.values().all(|o| o.is_success()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_work() {
        let coordinator = Arc::new(coordinator(10));
        let ctx = ExecutionContext::new();

        let running = {
            let coordinator = coordinator.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(&ctx, ["fast"], |_, _| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, BoxError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.active_executions(), 1);

        assert!(coordinator.shutdown(Duration::from_secs(1)).await);
        assert!(running.await.unwrap()["fast"].is_success());

        let results = coordinator
            .execute(&ctx, ["fast"], |_, _| async { Ok::<_, BoxError>(()) })
            .await;
        assert!(matches!(results["fast"].result, Err(ResourceError::ShuttingDown)));
    }

    #[test]
    fn test_context_builders() {
        let ctx = ExecutionContext::new()
            .with_request_id("req-1")
            .with_credential("key-abc");
        assert_eq!(ctx.request_id, "req-1");
        assert_eq!(ctx.credential.as_deref(), Some("key-abc"));
        assert_ne!(ctx.trace_id, ExecutionContext::new().trace_id);
    }
}
