//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! ExecutionCoordinator::execute(resources, operation):
//!     → registry.rs (breaker per resource, created on first use)
//!     → circuit_breaker.rs (is_open? skip : call)
//!     → per-resource timeout, outcome recorded on that breaker
//!     → history.rs (bounded call and transition logs)
//!     → backoff.rs (recovery timeout grows on repeated openings)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every resource call has a deadline
//! - One resource's failure never delays or fails another's result
//! - Breaker variants are policies injected into one state machine

pub mod backoff;
pub mod circuit_breaker;
pub mod coordinator;
pub mod history;
pub mod registry;

pub use circuit_breaker::{
    BreakerEventHandler, BreakerStatus, CircuitBreaker, CircuitBreakerStats, CircuitState,
    CleanupReport, TransitionReason,
};
pub use coordinator::{ExecutionContext, ExecutionCoordinator, ResourceOutcome};
pub use history::{BoundedHistory, CallRecord};
pub use registry::{BreakerRegistry, HealthStatus, HealthSummary, MemoryUsageSummary};
