//! Error taxonomy shared across subsystems.
//!
//! - [`Rejection`]: policy denials at admission (rate limit, quota). Terminal here;
//!   clients retry after `Retry-After`.
//! - [`ResourceError`]: per-resource outcomes in the coordinator. Never fail siblings.
//! - [`StoreError`]: counter/config backend unavailable. Admission fails open on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::quota::QuotaPeriod;
use crate::security::rate_limit::{Granularity, LimitScope};

pub use crate::store::StoreError;

/// Boxed cause carried by failed operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Machine-readable rejection reason sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RateLimited,
    QuotaExceededDaily,
    QuotaExceededMonthly,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::RateLimited => "rate_limited",
            RejectionReason::QuotaExceededDaily => "quota_exceeded_daily",
            RejectionReason::QuotaExceededMonthly => "quota_exceeded_monthly",
        }
    }
}

/// A request refused by admission policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error("rate limit exceeded for {scope} per {granularity} (limit {limit})")]
    AdmissionDenied {
        scope: LimitScope,
        granularity: Granularity,
        limit: u64,
        reset_at: DateTime<Utc>,
    },

    #[error("{period} quota exceeded ({used}/{limit})")]
    QuotaExceeded {
        period: QuotaPeriod,
        limit: u64,
        used: u64,
        reset_at: DateTime<Utc>,
    },
}

impl Rejection {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Rejection::AdmissionDenied { .. } => RejectionReason::RateLimited,
            Rejection::QuotaExceeded {
                period: QuotaPeriod::Daily,
                ..
            } => RejectionReason::QuotaExceededDaily,
            Rejection::QuotaExceeded {
                period: QuotaPeriod::Monthly,
                ..
            } => RejectionReason::QuotaExceededMonthly,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Rejection::AdmissionDenied { reset_at, .. } | Rejection::QuotaExceeded { reset_at, .. } => {
                *reset_at
            }
        }
    }
}

/// Outcome of a resource that did not produce a value.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Skipped by its circuit breaker; no call was attempted.
    #[error("circuit open for resource '{resource}'")]
    CircuitOpen { resource: String },

    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("operation failed: {source}")]
    Failure {
        #[source]
        source: BoxError,
    },

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl ResourceError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceError::CircuitOpen { .. } => "circuit_open",
            ResourceError::Timeout { .. } => "timeout",
            ResourceError::Failure { .. } => "failure",
            ResourceError::ShuttingDown => "shutting_down",
        }
    }
}
