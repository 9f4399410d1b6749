//! Quota subsystem.
//!
//! # Data Flow
//! ```text
//! Request with credential:
//!     → config_store.rs (cached quota config, default if none stored)
//!     → throttle.rs (atomic daily+monthly increment → reject | delay)
//!     → windows.rs (UTC window ids, TTLs, reset instants)
//!
//! Background:
//!     → sync.rs (periodic copy of live usage into the durable repository)
//! ```
//!
//! # Design Decisions
//! - Fast counters are the source of truth for enforcement
//! - Durable storage holds admin-set configs and reporting snapshots only
//! - Throttle delays suspend the request's own task, never a thread

pub mod config_store;
pub mod sync;
pub mod throttle;
pub mod windows;

pub use config_store::{
    JsonFileRepository, QuotaConfig, QuotaConfigStore, QuotaConfigUpdate, QuotaRepository,
    RepositoryError, UsageSnapshot,
};
pub use sync::UsageSyncer;
pub use throttle::{QuotaThrottle, QuotaUsage, ResetPeriod, ThrottleDecision, UsageReport};
pub use windows::QuotaPeriod;
