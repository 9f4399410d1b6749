//! Breaker registry.
//!
//! # Responsibilities
//! - Create one breaker per resource name, lazily, on first reference
//! - Merge global and per-resource config once, at creation
//! - Aggregate status, memory usage and health across breakers
//!
//! # Design Decisions
//! - Sharded map: creation takes the shard lock for that name only, so two callers
//!   racing on a new name still get the same breaker
//! - Aggregations read per-breaker counters, never walk history records

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::FaultToleranceConfig;
use crate::resilience::circuit_breaker::{
    BreakerEventHandler, BreakerStatus, CircuitBreaker, CircuitState, CleanupReport, MemoryUsage,
};

/// Overall health across resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every breaker closed.
    Healthy,
    /// Some breakers not closed.
    Degraded,
    /// No breaker closed.
    Unhealthy,
    /// No breakers yet.
    Unknown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub total_resources: usize,
    pub healthy_resources: usize,
    pub unhealthy_resources: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryUsageSummary {
    pub breaker_count: usize,
    pub total_call_records: usize,
    pub total_transition_records: usize,
    pub breakers: BTreeMap<String, MemoryUsage>,
}

/// Owner of every breaker in the process.
pub struct BreakerRegistry {
    config: FaultToleranceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<Arc<dyn BreakerEventHandler>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new(config: FaultToleranceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            events: None,
        }
    }

    /// Use `handler` for every breaker created from now on.
    pub fn with_event_handler(mut self, handler: Arc<dyn BreakerEventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    pub fn config(&self) -> &FaultToleranceConfig {
        &self.config
    }

    /// The breaker for `resource`, created on first use.
    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(resource) {
            return existing.clone();
        }
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                let config = self.config.breaker_for(resource);
                tracing::debug!(
                    resource = %resource,
                    failure_threshold = config.failure_threshold,
                    recovery_timeout_ms = config.recovery_timeout_ms,
                    "Circuit breaker created"
                );
                let breaker = CircuitBreaker::new(resource, config);
                let breaker = match &self.events {
                    Some(handler) => breaker.with_event_handler(handler.clone()),
                    None => breaker,
                };
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, resource: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(resource).map(|b| b.clone())
    }

    /// Snapshot of all breakers, sorted by name.
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<_> = self.breakers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.resource().cmp(b.resource()));
        all
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn operation_timeout(&self, resource: &str) -> Duration {
        self.config.operation_timeout_for(resource)
    }

    /// Reset one breaker. Returns false if it does not exist.
    pub fn reset(&self, resource: &str) -> bool {
        match self.get(resource) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        self.all().iter().map(|b| b.status()).collect()
    }

    pub fn memory_usage_summary(&self) -> MemoryUsageSummary {
        let breakers: BTreeMap<String, MemoryUsage> = self
            .all()
            .iter()
            .map(|b| (b.resource().to_string(), b.memory_usage()))
            .collect();
        MemoryUsageSummary {
            breaker_count: breakers.len(),
            total_call_records: breakers.values().map(|m| m.call_history_size).sum(),
            total_transition_records: breakers.values().map(|m| m.state_transitions_size).sum(),
            breakers,
        }
    }

    pub fn force_cleanup_all(&self) -> BTreeMap<String, CleanupReport> {
        let reports: BTreeMap<String, CleanupReport> = self
            .all()
            .iter()
            .map(|b| (b.resource().to_string(), b.force_cleanup()))
            .collect();
        tracing::info!(breakers = reports.len(), "Forced cleanup of all circuit breakers");
        reports
    }

    pub fn health_summary(&self) -> HealthSummary {
        let all = self.all();
        let total = all.len();
        let healthy = all
            .iter()
            .filter(|b| b.state() == CircuitState::Closed)
            .count();
        let unhealthy = total - healthy;
        let status = if total == 0 {
            HealthStatus::Unknown
        } else if unhealthy == 0 {
            HealthStatus::Healthy
        } else if unhealthy == total {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        HealthSummary {
            status,
            total_resources: total,
            healthy_resources: healthy,
            unhealthy_resources: unhealthy,
        }
    }
}
