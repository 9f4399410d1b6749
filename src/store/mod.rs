//! Counter store subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter / QuotaThrottle
//!     → CounterStore::increment (atomic, one or many keys)
//!     → memory.rs (in-process store) or any shared backend implementing the trait
//!
//! UsageSyncer / admin
//!     → CounterStore::scan_prefix / get / delete
//! ```
//!
//! # Design Decisions
//! - Callers never read-then-write: every increment is a single store operation
//! - A multi-key increment is all-or-nothing and observed as one step
//! - Keys carry their own TTL, applied when the key is created
//! - Store failures surface as `StoreError`; the callers decide to fail open

pub mod clock;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryCounterStore;

/// The counter backend could not serve the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
}

/// One key to increment, with the TTL applied if the increment creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterIncrement {
    pub key: String,
    pub ttl: Duration,
}

impl CounterIncrement {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
        }
    }
}

/// Atomic windowed counters shared by the rate limiter and the quota throttle.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment every key by one as a single atomic step and return the new values,
    /// in the same order as `increments`.
    async fn increment(&self, increments: &[CounterIncrement]) -> Result<Vec<u64>, StoreError>;

    /// Current value of a live key.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Overwrite a key with a value and TTL.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Remove keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// All live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError>;
}

/// Bound a store call so a hung backend reads as an error instead of stalling admission.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let hung = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1u64)
        })
        .await;
        assert_eq!(hung, Err(StoreError::Timeout(Duration::from_millis(50))));

        let fast = with_timeout(Duration::from_millis(50), async { Ok(2u64) }).await;
        assert_eq!(fast, Ok(2));
    }
}
