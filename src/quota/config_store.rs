//! Per-credential quota settings.
//!
//! # Responsibilities
//! - Resolve a credential's quota config: stored settings or a synthesized default
//! - Apply administrative partial updates and deletions
//! - Persist configs and usage snapshots durably (JSON file)
//! - Cache resolved configs for a short TTL
//!
//! # Design Decisions
//! - Defaults are never persisted; a credential only gets a stored row when an
//!   administrator sets something
//! - Usage counts are never cached here; enforcement reads live counters
//! - Repository failures on the read path fall back to defaults with a warning
//! - File writes happen after the data lock is released, so lookups never wait on disk
//! - Expired cache entries are evicted by the periodic purge in `main`

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::DefaultQuotas;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("quota repository I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("quota repository data error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Quota settings for one credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub credential_id: String,
    /// `None` means unlimited.
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
    pub throttle_enabled: bool,
    /// 1 (highest) to 10 (lowest); scales the throttle delay.
    pub priority: u8,
    /// True when synthesized from global defaults.
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl QuotaConfig {
    pub fn default_for(credential: &str, defaults: &DefaultQuotas) -> Self {
        Self {
            credential_id: credential.to_string(),
            daily_limit: defaults.daily_limit,
            monthly_limit: defaults.monthly_limit,
            throttle_enabled: true,
            priority: DEFAULT_PRIORITY,
            is_default: true,
            updated_at: None,
        }
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update. For limits, a missing field keeps the current value and an
/// explicit `null` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfigUpdate {
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub daily_limit: Option<Option<u64>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub monthly_limit: Option<Option<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl QuotaConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.daily_limit.is_none()
            && self.monthly_limit.is_none()
            && self.throttle_enabled.is_none()
            && self.priority.is_none()
    }

    fn apply(&self, config: &mut QuotaConfig) {
        if let Some(limit) = self.daily_limit {
            config.daily_limit = limit;
        }
        if let Some(limit) = self.monthly_limit {
            config.monthly_limit = limit;
        }
        if let Some(enabled) = self.throttle_enabled {
            config.throttle_enabled = enabled;
        }
        if let Some(priority) = self.priority {
            config.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        }
    }
}

/// Usage copied from the fast counters for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub credential_id: String,
    pub daily_count: u64,
    pub daily_window_id: String,
    pub monthly_count: u64,
    pub monthly_window_id: String,
    pub last_request_time: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// Durable storage for quota configs and usage snapshots.
pub trait QuotaRepository: Send + Sync + std::fmt::Debug {
    fn load_config(&self, credential: &str) -> Result<Option<QuotaConfig>, RepositoryError>;
    fn save_config(&self, config: &QuotaConfig) -> Result<(), RepositoryError>;
    /// Returns true if a stored config was removed.
    fn delete_config(&self, credential: &str) -> Result<bool, RepositoryError>;
    fn list_configs(&self) -> Result<Vec<QuotaConfig>, RepositoryError>;
    fn save_usage(&self, snapshots: &[UsageSnapshot]) -> Result<(), RepositoryError>;
    fn usage_snapshot(&self, credential: &str) -> Result<Option<UsageSnapshot>, RepositoryError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepositoryData {
    #[serde(default)]
    configs: HashMap<String, QuotaConfig>,
    #[serde(default)]
    usage: HashMap<String, UsageSnapshot>,
}

/// Repository kept in memory and, with a path, written through to a JSON file.
#[derive(Debug, Default)]
pub struct JsonFileRepository {
    data: Mutex<RepositoryData>,
    path: Option<PathBuf>,
    /// Revision of the last serialized state, bumped under the data lock.
    revision: AtomicU64,
    /// Held only while writing; stores the revision on disk.
    written: Mutex<u64>,
}

impl JsonFileRepository {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open `path`, loading it if it exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let data: RepositoryData = serde_json::from_reader(reader)?;
            tracing::info!(
                path = %path.display(),
                configs = data.configs.len(),
                snapshots = data.usage.len(),
                "Loaded quota repository"
            );
            data
        } else {
            RepositoryData::default()
        };
        Ok(Self {
            data: Mutex::new(data),
            path: Some(path),
            ..Self::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialize the current state while the data lock is held.
    fn snapshot(&self, data: &RepositoryData) -> Result<Option<Pending>, RepositoryError> {
        if self.path.is_none() {
            return Ok(None);
        }
        Ok(Some(Pending {
            revision: self.revision.fetch_add(1, Ordering::SeqCst) + 1,
            bytes: serde_json::to_vec_pretty(data)?,
        }))
    }

    /// Write a serialized state via a temp file and rename, after the data lock is
    /// released. A state older than the one already on disk is skipped.
    fn persist(&self, pending: Option<Pending>) -> Result<(), RepositoryError> {
        let (Some(path), Some(pending)) = (&self.path, pending) else {
            return Ok(());
        };
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if pending.revision <= *written {
            return Ok(());
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&pending.bytes)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        *written = pending.revision;
        Ok(())
    }
}

#[derive(Debug)]
struct Pending {
    revision: u64,
    bytes: Vec<u8>,
}

impl QuotaRepository for JsonFileRepository {
    fn load_config(&self, credential: &str) -> Result<Option<QuotaConfig>, RepositoryError> {
        Ok(self.lock().configs.get(credential).cloned())
    }

    fn save_config(&self, config: &QuotaConfig) -> Result<(), RepositoryError> {
        let pending = {
            let mut data = self.lock();
            data.configs
                .insert(config.credential_id.clone(), config.clone());
            self.snapshot(&data)?
        };
        self.persist(pending)
    }

    fn delete_config(&self, credential: &str) -> Result<bool, RepositoryError> {
        let pending = {
            let mut data = self.lock();
            if data.configs.remove(credential).is_none() {
                return Ok(false);
            }
            self.snapshot(&data)?
        };
        self.persist(pending)?;
        Ok(true)
    }

    fn list_configs(&self) -> Result<Vec<QuotaConfig>, RepositoryError> {
        let mut configs: Vec<_> = self.lock().configs.values().cloned().collect();
        configs.sort_by(|a, b| a.credential_id.cmp(&b.credential_id));
        Ok(configs)
    }

    fn save_usage(&self, snapshots: &[UsageSnapshot]) -> Result<(), RepositoryError> {
        let Some(latest) = snapshots.iter().map(|s| s.monthly_window_id.as_str()).max() else {
            return Ok(());
        };
        let pending = {
            let mut data = self.lock();
            for snapshot in snapshots {
                data.usage
                    .insert(snapshot.credential_id.clone(), snapshot.clone());
            }
            // Snapshots from an earlier month describe windows that no longer count.
            data.usage
                .retain(|_, snapshot| snapshot.monthly_window_id.as_str() >= latest);
            self.snapshot(&data)?
        };
        self.persist(pending)
    }

    fn usage_snapshot(&self, credential: &str) -> Result<Option<UsageSnapshot>, RepositoryError> {
        Ok(self.lock().usage.get(credential).cloned())
    }
}

/// Cached view over the repository with default fallback.
#[derive(Debug)]
pub struct QuotaConfigStore {
    repository: Arc<dyn QuotaRepository>,
    defaults: DefaultQuotas,
    cache: DashMap<String, (QuotaConfig, Instant)>,
    cache_ttl: Duration,
    /// Bumped on every invalidation; a lookup that started before one is not cached.
    generation: AtomicU64,
}

impl QuotaConfigStore {
    pub fn new(
        repository: Arc<dyn QuotaRepository>,
        defaults: DefaultQuotas,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            repository,
            defaults,
            cache: DashMap::new(),
            cache_ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn repository(&self) -> &Arc<dyn QuotaRepository> {
        &self.repository
    }

    pub fn defaults(&self) -> &DefaultQuotas {
        &self.defaults
    }

    /// Stored config or the synthesized default. Never fails.
    pub fn resolve(&self, credential: &str) -> QuotaConfig {
        if let Some(entry) = self.cache.get(credential) {
            let (config, cached_at) = entry.value();
            if cached_at.elapsed() < self.cache_ttl {
                return config.clone();
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let config = match self.repository.load_config(credential) {
            Ok(Some(stored)) => stored,
            Ok(None) => QuotaConfig::default_for(credential, &self.defaults),
            Err(e) => {
                tracing::warn!(error = %e, "Quota config lookup failed, using defaults");
                // Not cached, so the next request retries the repository.
                return QuotaConfig::default_for(credential, &self.defaults);
            }
        };

        // The entry holds the shard lock, so an invalidation either bumped the
        // generation before this check or removes the entry after it.
        let entry = self.cache.entry(credential.to_string());
        if self.generation.load(Ordering::SeqCst) == generation {
            entry.insert((config.clone(), Instant::now()));
        }
        config
    }

    /// Apply a partial update on top of the current config and store it.
    pub fn update(
        &self,
        credential: &str,
        update: &QuotaConfigUpdate,
    ) -> Result<QuotaConfig, RepositoryError> {
        let mut config = self
            .repository
            .load_config(credential)?
            .unwrap_or_else(|| QuotaConfig::default_for(credential, &self.defaults));
        update.apply(&mut config);
        config.is_default = false;
        config.updated_at = Some(Utc::now());

        self.repository.save_config(&config)?;
        self.invalidate(credential);
        tracing::info!(
            credential = %crate::security::rate_limit::credential_prefix(credential),
            daily_limit = ?config.daily_limit,
            monthly_limit = ?config.monthly_limit,
            priority = config.priority,
            "Quota config updated"
        );
        Ok(config)
    }

    /// Drop stored settings; the credential reverts to defaults.
    pub fn delete(&self, credential: &str) -> Result<bool, RepositoryError> {
        let removed = self.repository.delete_config(credential)?;
        self.invalidate(credential);
        Ok(removed)
    }

    pub fn invalidate(&self, credential: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(credential);
    }

    /// Drop cache entries past their TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, (_, cached_at)| cached_at.elapsed() < self.cache_ttl);
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn store(ttl: Duration) -> QuotaConfigStore {
        QuotaConfigStore::new(
            Arc::new(JsonFileRepository::in_memory()),
            DefaultQuotas::default(),
            ttl,
        )
    }

    #[test]
    fn test_absent_config_resolves_to_default_and_is_not_persisted() {
        let store = store(Duration::from_secs(300));
        let config = store.resolve("key-1");
        assert!(config.is_default);
        assert_eq!(config.daily_limit, Some(10_000));
        assert_eq!(config.monthly_limit, Some(100_000));
        assert_eq!(config.priority, DEFAULT_PRIORITY);
        assert!(config.throttle_enabled);
        assert!(store.repository().list_configs().unwrap().is_empty());
    }

    #[test]
    fn test_partial_update_and_explicit_null() {
        let store = store(Duration::from_secs(300));
        store.resolve("key-1");

        let update: QuotaConfigUpdate =
            serde_json::from_str(r#"{"daily_limit": 50, "priority": 42}"#).unwrap();
        let config = store.update("key-1", &update).unwrap();
        assert_eq!(config.daily_limit, Some(50));
        assert_eq!(config.monthly_limit, Some(100_000));
        assert_eq!(config.priority, MAX_PRIORITY);
        assert!(!config.is_default);

        // The cache was invalidated by the update.
        assert_eq!(store.resolve("key-1").daily_limit, Some(50));

        let update: QuotaConfigUpdate = serde_json::from_str(r#"{"monthly_limit": null}"#).unwrap();
        assert_eq!(update.monthly_limit, Some(None));
        assert_eq!(update.daily_limit, None);
        let config = store.update("key-1", &update).unwrap();
        assert_eq!(config.daily_limit, Some(50));
        assert_eq!(config.monthly_limit, None);

        assert!(store.delete("key-1").unwrap());
        assert!(store.resolve("key-1").is_default);
        assert!(!store.delete("key-1").unwrap());
    }

    #[test]
    fn test_cache_serves_until_ttl() {
        let repository = Arc::new(JsonFileRepository::in_memory());
        let store = QuotaConfigStore::new(
            repository.clone(),
            DefaultQuotas::default(),
            Duration::from_secs(300),
        );
        assert!(store.resolve("key-1").is_default);

        // Written behind the store's back: the cached default is still served.
        let mut config = QuotaConfig::default_for("key-1", &DefaultQuotas::default());
        config.is_default = false;
        config.daily_limit = Some(1);
        repository.save_config(&config).unwrap();
        assert!(store.resolve("key-1").is_default);

        let uncached = QuotaConfigStore::new(repository, DefaultQuotas::default(), Duration::ZERO);
        assert_eq!(uncached.resolve("key-1").daily_limit, Some(1));
    }

    #[test]
    fn test_expired_cache_entries_are_purged() {
        let store = store(Duration::from_millis(50));
        for n in 0..500 {
            store.resolve(&format!("random-{n}"));
        }
        assert_eq!(store.cached_len(), 500);

        std::thread::sleep(Duration::from_millis(100));
        store.resolve("fresh");
        assert_eq!(store.purge_expired(), 500);
        assert_eq!(store.cached_len(), 1);
    }

    /// Pauses the first `load_config` after it has read, until released.
    #[derive(Debug)]
    struct PausedLoad {
        inner: JsonFileRepository,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl QuotaRepository for PausedLoad {
        fn load_config(&self, credential: &str) -> Result<Option<QuotaConfig>, RepositoryError> {
            let loaded = self.inner.load_config(credential);
            let gate = self.gate.lock().unwrap().take();
            if let Some((read_done, release)) = gate {
                read_done.send(()).unwrap();
                release.recv().unwrap();
            }
            loaded
        }
        fn save_config(&self, config: &QuotaConfig) -> Result<(), RepositoryError> {
            self.inner.save_config(config)
        }
        fn delete_config(&self, credential: &str) -> Result<bool, RepositoryError> {
            self.inner.delete_config(credential)
        }
        fn list_configs(&self) -> Result<Vec<QuotaConfig>, RepositoryError> {
            self.inner.list_configs()
        }
        fn save_usage(&self, snapshots: &[UsageSnapshot]) -> Result<(), RepositoryError> {
            self.inner.save_usage(snapshots)
        }
        fn usage_snapshot(&self, credential: &str) -> Result<Option<UsageSnapshot>, RepositoryError> {
            self.inner.usage_snapshot(credential)
        }
    }

    #[test]
    fn test_lookup_overtaken_by_update_is_not_cached() {
        let (read_done_tx, read_done_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let repository = Arc::new(PausedLoad {
            inner: JsonFileRepository::in_memory(),
            gate: Mutex::new(Some((read_done_tx, release_rx))),
        });
        let store = Arc::new(QuotaConfigStore::new(
            repository,
            DefaultQuotas::default(),
            Duration::from_secs(300),
        ));

        let lookup = {
            let store = store.clone();
            std::thread::spawn(move || store.resolve("key-1"))
        };
        read_done_rx.recv().unwrap();

        let update = QuotaConfigUpdate {
            daily_limit: Some(Some(5)),
            ..QuotaConfigUpdate::default()
        };
        store.update("key-1", &update).unwrap();
        release_tx.send(()).unwrap();

        // The lookup read before the update and returns the old value...
        assert!(lookup.join().unwrap().is_default);
        // ...but must not leave it in the cache.
        assert_eq!(store.resolve("key-1").daily_limit, Some(5));
    }

    #[test]
    fn test_reads_proceed_while_file_write_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(JsonFileRepository::open(dir.path().join("quotas.json")).unwrap());
        let mut config = QuotaConfig::default_for("key-1", &DefaultQuotas::default());
        config.is_default = false;

        let write_guard = repo.written.lock().unwrap();
        let writer = {
            let repo = repo.clone();
            let config = config.clone();
            std::thread::spawn(move || repo.save_config(&config))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while repo.load_config("key-1").unwrap().is_none() {
            assert!(Instant::now() < deadline, "save never reached the file write");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(repo.list_configs().unwrap(), vec![config.clone()]);

        drop(write_guard);
        writer.join().unwrap().unwrap();
        let reopened = JsonFileRepository::open(dir.path().join("quotas.json")).unwrap();
        assert_eq!(reopened.load_config("key-1").unwrap(), Some(config));
    }

    fn snapshot(credential: &str, month: &str) -> UsageSnapshot {
        UsageSnapshot {
            credential_id: credential.into(),
            daily_count: 1,
            daily_window_id: format!("{month}01"),
            monthly_count: 1,
            monthly_window_id: month.into(),
            last_request_time: None,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_usage_from_earlier_months_is_dropped() {
        let repo = JsonFileRepository::in_memory();
        repo.save_usage(&[snapshot("old", "202605"), snapshot("kept", "202605")])
            .unwrap();
        repo.save_usage(&[snapshot("kept", "202606"), snapshot("new", "202606")])
            .unwrap();

        assert!(repo.usage_snapshot("old").unwrap().is_none());
        assert_eq!(
            repo.usage_snapshot("kept").unwrap().unwrap().monthly_window_id,
            "202606"
        );
        assert!(repo.usage_snapshot("new").unwrap().is_some());
    }

    #[test]
    fn test_file_repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotas.json");

        let repo = JsonFileRepository::open(&path).unwrap();
        let mut config = QuotaConfig::default_for("key-1", &DefaultQuotas::default());
        config.priority = 2;
        config.is_default = false;
        repo.save_config(&config).unwrap();
        repo.save_usage(&[UsageSnapshot {
            credential_id: "key-1".into(),
            daily_count: 3,
            daily_window_id: "20260610".into(),
            monthly_count: 9,
            monthly_window_id: "202606".into(),
            last_request_time: None,
            synced_at: Utc::now(),
        }])
        .unwrap();

        let reopened = JsonFileRepository::open(&path).unwrap();
        assert_eq!(reopened.load_config("key-1").unwrap(), Some(config));
        assert_eq!(reopened.usage_snapshot("key-1").unwrap().unwrap().monthly_count, 9);
    }
}
