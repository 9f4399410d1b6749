//! In-process counter store.
//!
//! # Responsibilities
//! - Atomic single- and multi-key increments with per-key TTL
//! - Lazy expiry (an expired key reads as absent and restarts at 1)
//! - Prefix scans for usage reporting and sync
//!
//! # Design Decisions
//! - One mutex over the whole map: a multi-key increment must be observed as one
//!   step, and every operation holds the lock for O(keys) work only
//! - Expiry is evaluated against the injected [`Clock`] so window tests can move time

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::store::{Clock, CounterIncrement, CounterStore, StoreError, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Counter store living in this process.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of keys held, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, increments: &[CounterIncrement]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let mut values = Vec::with_capacity(increments.len());

        for inc in increments {
            let entry = entries.entry(inc.key.clone()).or_insert(Entry {
                value: 0,
                expires_at: now,
            });
            if !entry.is_live(now) {
                entry.value = 0;
                entry.expires_at = Self::expiry(now, inc.ttl);
            }
            entry.value += 1;
            values.push(entry.value);
        }

        Ok(values)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value))
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let removed = keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| e.is_live(now))
            .count();
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value))
            .collect())
    }
}
