//! Size- and age-capped event log.
//!
//! # Responsibilities
//! - Keep the most recent records of a breaker (calls, state transitions)
//! - Enforce `max_size` on every push, oldest discarded first
//! - Drop records older than `max_age` on cleanup
//!
//! # Design Decisions
//! - One short mutex per history; pushes never wait on the breaker state lock
//! - Size cap is enforced inside the push critical section, so it holds under any
//!   interleaving of concurrent writers

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A record that knows when it happened.
pub trait Timestamped {
    fn timestamp(&self) -> Instant;
}

/// Outcome of one protected call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallRecord {
    pub timestamp: Instant,
    pub success: bool,
    pub execution_time: Duration,
}

impl Timestamped for CallRecord {
    fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Thread-safe bounded log.
#[derive(Debug)]
pub struct BoundedHistory<T> {
    records: Mutex<VecDeque<T>>,
    max_size: usize,
    max_age: Duration,
}

impl<T: Timestamped + Clone> BoundedHistory<T> {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            max_size,
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record, evicting the oldest ones beyond `max_size`.
    pub fn push(&self, record: T) {
        let mut records = self.lock();
        records.push_back(record);
        while records.len() > self.max_size {
            records.pop_front();
        }
    }

    /// Remove records aged `max_age` or more and re-apply the size cap.
    /// Returns how many records were removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| now.saturating_duration_since(r.timestamp()) < self.max_age);
        while records.len() > self.max_size {
            records.pop_front();
        }
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Copy of the records, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    /// Copy of the last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let records = self.lock();
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    /// Count records at or after `since` matching `pred`.
    pub fn count_since<F>(&self, since: Instant, pred: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        self.lock()
            .iter()
            .filter(|r| r.timestamp() >= since && pred(r))
            .count()
    }

    /// Fold over all records under the lock.
    pub fn fold<A, F>(&self, init: A, f: F) -> A
    where
        F: FnMut(A, &T) -> A,
    {
        self.lock().iter().fold(init, f)
    }
}
