//! Traffic-control layer for API services.
//!
//! Admission (per-IP and per-credential rate limits), daily/monthly quotas with
//! graduated throttling, and circuit-breaker protected fan-out to backend resources.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod store;

// Traffic management
pub mod quota;
pub mod security;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::GatekeeperConfig;
pub use error::{Rejection, ResourceError};
pub use http::{AppState, HttpServer};
pub use lifecycle::Shutdown;
pub use resilience::{ExecutionContext, ExecutionCoordinator, ResourceOutcome};
