//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatekeeperConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Per-resource breaker overrides are merged once, when the breaker is created

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BreakerConfig, CredentialConfig, DefaultQuotas, DelayConfig, DelayCurve,
    ExecutionConfig, FaultToleranceConfig, GatekeeperConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, PriorityMultiplier, RateLimitConfig, ResourceOverride, ThrottleConfig,
    WindowLimits,
};
