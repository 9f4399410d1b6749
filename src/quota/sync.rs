//! Background usage sync.
//!
//! # Responsibilities
//! - Periodically copy current-window usage from the fast counters into the
//!   durable repository, for reporting
//! - Run one last sync on shutdown
//!
//! # Design Decisions
//! - Best effort: a failed round is logged and the next tick tries again
//! - Enforcement never reads what this task writes, so delays or skips are harmless
//! - The file write runs on the blocking pool, outside the repository lock

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::quota::config_store::{QuotaRepository, RepositoryError};
use crate::quota::throttle::QuotaThrottle;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("usage write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct UsageSyncer {
    throttle: Arc<QuotaThrottle>,
    repository: Arc<dyn QuotaRepository>,
    interval: Duration,
}

impl UsageSyncer {
    pub fn new(throttle: Arc<QuotaThrottle>, interval: Duration) -> Self {
        let repository = throttle.configs().repository().clone();
        Self {
            throttle,
            repository,
            interval,
        }
    }

    /// Copy usage once. Returns how many credentials were written.
    pub async fn sync_once(&self) -> Result<usize, SyncError> {
        let snapshots = self.throttle.usage_snapshots().await?;
        if snapshots.is_empty() {
            return Ok(0);
        }
        let synced = snapshots.len();
        let repository = self.repository.clone();
        tokio::task::spawn_blocking(move || repository.save_usage(&snapshots)).await??;
        Ok(synced)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.throttle.is_enabled() {
            tracing::info!("Quota throttling disabled, usage sync not started");
            return;
        }

        tracing::info!(interval_secs = self.interval.as_secs(), "Usage syncer starting");

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_logged().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Usage syncer received shutdown signal, running final sync");
                    self.sync_logged().await;
                    break;
                }
            }
        }
    }

    async fn sync_logged(&self) {
        match self.sync_once().await {
            Ok(0) => {}
            Ok(synced) => tracing::debug!(credentials = synced, "Usage synced"),
            Err(e) => tracing::warn!(error = %e, "Usage sync failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultQuotas, ThrottleConfig};
    use crate::quota::config_store::{JsonFileRepository, QuotaConfigStore};

    use crate::store::MemoryCounterStore;

    fn throttle() -> (Arc<JsonFileRepository>, Arc<QuotaThrottle>) {
        let repository = Arc::new(JsonFileRepository::in_memory());
        let configs = Arc::new(QuotaConfigStore::new(
            repository.clone(),
            DefaultQuotas::default(),
            Duration::from_secs(300),
        ));
        let throttle = QuotaThrottle::new(
            ThrottleConfig::default(),
            Some(Arc::new(MemoryCounterStore::new())),
            configs,
        );
        (repository, Arc::new(throttle))
    }

    #[tokio::test]
    async fn test_sync_once_writes_snapshots() {
        let (repository, throttle) = throttle();
        let syncer = UsageSyncer::new(throttle.clone(), Duration::from_secs(60));
        assert_eq!(syncer.sync_once().await.unwrap(), 0);

        for _ in 0..4 {
            throttle.check_and_throttle(Some("key-1")).await;
        }
        assert_eq!(syncer.sync_once().await.unwrap(), 1);
        let snapshot = repository.usage_snapshot("key-1").unwrap().unwrap();
        assert_eq!((snapshot.daily_count, snapshot.monthly_count), (4, 4));
    }

    #[tokio::test]
    async fn test_final_sync_on_shutdown() {
        let (repository, throttle) = throttle();
        throttle.check_and_throttle(Some("key-1")).await;

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(UsageSyncer::new(throttle, Duration::from_secs(3600)).run(rx));
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(repository.usage_snapshot("key-1").unwrap().unwrap().daily_count, 1);
    }
}
