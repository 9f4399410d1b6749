//! Quota enforcement and graduated throttling.
//!
//! # Responsibilities
//! - Count every tracked request against its daily and monthly windows
//! - Reject once a window's count exceeds its limit (daily checked first)
//! - Compute a delay that grows as usage approaches the limit
//! - Administrative reads and resets of usage; usage reports
//!
//! # Delay Curve
//! ```text
//! usage <= threshold      → 0
//! normalized = (usage − threshold) / (1 − threshold), usage capped at 1.0
//! base = min + (max − min) × (normalized² | normalized)
//! delay = min(base × priority_multiplier, 2 × max)
//! ```
//!
//! # Design Decisions
//! - Daily and monthly counters move in one atomic increment
//! - Enforcement reads the live counters, never synced copies
//! - Fail open: a store failure admits the request untracked
//! - Unlisted priorities interpolate linearly between table entries and clamp at the ends

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DelayCurve, PriorityMultiplier, ThrottleConfig};
use crate::error::Rejection;
use crate::observability::metrics;
use crate::quota::config_store::{
    QuotaConfig, QuotaConfigStore, QuotaConfigUpdate, RepositoryError, UsageSnapshot,
};
use crate::quota::windows::{self, QuotaPeriod};
use crate::security::rate_limit::{credential_prefix, is_excluded_path, STORE_TIMEOUT};
use crate::store::{self, Clock, CounterIncrement, CounterStore, StoreError, SystemClock};

/// Live usage of one credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub credential_id: String,
    pub daily_used: u64,
    pub daily_window_id: String,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_used: u64,
    pub monthly_window_id: String,
    pub monthly_reset_at: DateTime<Utc>,
    pub last_request_time: Option<DateTime<Utc>>,
}

/// Requests left in each window; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub daily: Option<u64>,
    pub monthly: Option<u64>,
}

impl Remaining {
    pub fn of(config: &QuotaConfig, daily_used: u64, monthly_used: u64) -> Self {
        Self {
            daily: config.daily_limit.map(|l| l.saturating_sub(daily_used)),
            monthly: config.monthly_limit.map(|l| l.saturating_sub(monthly_used)),
        }
    }
}

/// Quota metadata attached to a tracked request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaState {
    pub delay_ms: u64,
    pub usage_ratio: f64,
    pub remaining: Remaining,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
}

/// Outcome of [`QuotaThrottle::check_and_throttle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Not counted: no credential, throttling off, or the store is unavailable.
    Untracked,
    /// Counted and admitted, possibly after `state.delay_ms`.
    Allow(QuotaState),
    /// A window is exhausted.
    Reject {
        rejection: Rejection,
        state: QuotaState,
    },
}

impl ThrottleDecision {
    pub fn delay_ms(&self) -> u64 {
        match self {
            ThrottleDecision::Allow(state) => state.delay_ms,
            _ => 0,
        }
    }

    pub fn state(&self) -> Option<&QuotaState> {
        match self {
            ThrottleDecision::Untracked => None,
            ThrottleDecision::Allow(state) | ThrottleDecision::Reject { state, .. } => Some(state),
        }
    }
}

/// Which counters to reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    Daily,
    Monthly,
    #[default]
    All,
}

/// One row of the usage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReportEntry {
    pub credential_id: String,
    pub daily_used: u64,
    pub monthly_used: u64,
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub sort_by: QuotaPeriod,
    pub entries: Vec<UsageReportEntry>,
}

/// Config, live usage and remaining for one credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub config: QuotaConfig,
    pub usage: QuotaUsage,
    pub remaining: Remaining,
}

#[derive(Debug, Default, Clone, Copy)]
struct CurrentUsage {
    daily: u64,
    monthly: u64,
}

/// Daily/monthly quota tracker with graduated delay.
#[derive(Debug)]
pub struct QuotaThrottle {
    config: ThrottleConfig,
    priorities: Vec<PriorityMultiplier>,
    store: Option<Arc<dyn CounterStore>>,
    configs: Arc<QuotaConfigStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaThrottle {
    pub fn new(
        config: ThrottleConfig,
        store: Option<Arc<dyn CounterStore>>,
        configs: Arc<QuotaConfigStore>,
    ) -> Self {
        Self::with_clock(config, store, configs, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ThrottleConfig,
        store: Option<Arc<dyn CounterStore>>,
        configs: Arc<QuotaConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut priorities = config.priority_multipliers.clone();
        priorities.sort_by_key(|p| p.priority);
        priorities.dedup_by_key(|p| p.priority);
        if store.is_none() && config.enabled {
            tracing::warn!("Quota throttle has no counter store; usage will not be tracked");
        }
        Self {
            config,
            priorities,
            store,
            configs,
            clock,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn configs(&self) -> &Arc<QuotaConfigStore> {
        &self.configs
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        is_excluded_path(path, &self.config.exclude_paths)
    }

    fn store(&self) -> Result<&dyn CounterStore, StoreError> {
        self.store
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("no counter store configured".into()))
    }

    /// Count one request for `credential` and decide whether and how long to hold it.
    pub async fn check_and_throttle(&self, credential: Option<&str>) -> ThrottleDecision {
        let Some(credential) = credential else {
            return ThrottleDecision::Untracked;
        };
        if !self.config.enabled {
            return ThrottleDecision::Untracked;
        }
        let Some(store) = self.store.as_deref() else {
            return ThrottleDecision::Untracked;
        };

        let quota = self.configs.resolve(credential);
        if !quota.throttle_enabled {
            return ThrottleDecision::Untracked;
        }

        let now = self.clock.now();
        let increments = [
            CounterIncrement::new(
                QuotaPeriod::Daily.usage_key(credential, now),
                QuotaPeriod::Daily.ttl(now),
            ),
            CounterIncrement::new(
                QuotaPeriod::Monthly.usage_key(credential, now),
                QuotaPeriod::Monthly.ttl(now),
            ),
        ];
        let (daily_used, monthly_used) =
            match store::with_timeout(STORE_TIMEOUT, store.increment(&increments)).await {
                Ok(counts) if counts.len() == 2 => (counts[0], counts[1]),
                Ok(_) => {
                    return self.store_failed(
                        StoreError::Unavailable("counter store returned no values".into()),
                        credential,
                    )
                }
                Err(e) => return self.store_failed(e, credential),
            };

        let last_request_key = windows::last_request_key(credential);
        let last_request = store.set(
            &last_request_key,
            now.timestamp().max(0) as u64,
            QuotaPeriod::Monthly.ttl(now),
        );
        if let Err(e) = store::with_timeout(STORE_TIMEOUT, last_request).await {
            tracing::debug!(error = %e, "Failed to record last request time");
        }

        let mut state = QuotaState {
            delay_ms: 0,
            usage_ratio: usage_ratio(&quota, daily_used, monthly_used),
            remaining: Remaining::of(&quota, daily_used, monthly_used),
            daily_reset_at: QuotaPeriod::Daily.reset_at(now),
            monthly_reset_at: QuotaPeriod::Monthly.reset_at(now),
        };

        let exceeded = [
            (QuotaPeriod::Daily, quota.daily_limit, daily_used, state.daily_reset_at),
            (QuotaPeriod::Monthly, quota.monthly_limit, monthly_used, state.monthly_reset_at),
        ]
        .into_iter()
        .find_map(|(period, limit, used, reset_at)| {
            limit
                .filter(|limit| used > *limit)
                .map(|limit| (period, limit, used, reset_at))
        });

        if let Some((period, limit, used, reset_at)) = exceeded {
            tracing::warn!(
                credential = %credential_prefix(credential),
                period = %period,
                used,
                limit,
                "Quota exceeded"
            );
            metrics::record_quota_rejected(period.as_str());
            return ThrottleDecision::Reject {
                rejection: Rejection::QuotaExceeded {
                    period,
                    limit,
                    used,
                    reset_at,
                },
                state,
            };
        }

        state.delay_ms = self.calculate_delay(state.usage_ratio, quota.priority);
        if state.delay_ms > 0 {
            tracing::debug!(
                credential = %credential_prefix(credential),
                usage_percent = state.usage_ratio * 100.0,
                delay_ms = state.delay_ms,
                "Throttling request"
            );
            metrics::record_throttle_delay(state.delay_ms);
        }
        ThrottleDecision::Allow(state)
    }

    fn store_failed(&self, error: StoreError, credential: &str) -> ThrottleDecision {
        tracing::warn!(
            credential = %credential_prefix(credential),
            error = %error,
            "Quota check failed, allowing request"
        );
        metrics::record_store_error("quota");
        ThrottleDecision::Untracked
    }

    /// Delay in milliseconds for a usage ratio (1.0 = limit reached) and priority.
    pub fn calculate_delay(&self, usage_ratio: f64, priority: u8) -> u64 {
        let delay = &self.config.delay;
        let threshold = delay.threshold_percent / 100.0;
        if usage_ratio <= threshold {
            return 0;
        }

        let usage = usage_ratio.min(1.0);
        let normalized = if threshold >= 1.0 {
            1.0
        } else {
            ((usage - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
        };
        let factor = match delay.curve {
            DelayCurve::Exponential => normalized * normalized,
            DelayCurve::Linear => normalized,
        };

        let (min, max) = (delay.min_ms as f64, delay.max_ms as f64);
        let base = min + (max - min) * factor;
        let scaled = (base * self.priority_multiplier(priority)).round().max(0.0) as u64;
        scaled.min(delay.max_ms.saturating_mul(2))
    }

    /// Multiplier for `priority`, interpolated between table entries.
    pub fn priority_multiplier(&self, priority: u8) -> f64 {
        let (Some(first), Some(last)) = (self.priorities.first(), self.priorities.last()) else {
            return 1.0;
        };
        if priority <= first.priority {
            return first.multiplier;
        }
        if priority >= last.priority {
            return last.multiplier;
        }
        for pair in self.priorities.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if priority == lo.priority {
                return lo.multiplier;
            }
            if priority > lo.priority && priority <= hi.priority {
                let ratio = f64::from(priority - lo.priority) / f64::from(hi.priority - lo.priority);
                return lo.multiplier + (hi.multiplier - lo.multiplier) * ratio;
            }
        }
        1.0
    }

    /// Live usage without counting a request.
    pub async fn get_usage(&self, credential: &str) -> Result<QuotaUsage, StoreError> {
        let store = self.store()?;
        let now = self.clock.now();
        let daily_key = QuotaPeriod::Daily.usage_key(credential, now);
        let monthly_key = QuotaPeriod::Monthly.usage_key(credential, now);

        let daily_used = store::with_timeout(STORE_TIMEOUT, store.get(&daily_key)).await?;
        let monthly_used = store::with_timeout(STORE_TIMEOUT, store.get(&monthly_key)).await?;
        let last_request = store::with_timeout(
            STORE_TIMEOUT,
            store.get(&windows::last_request_key(credential)),
        )
        .await?;

        Ok(QuotaUsage {
            credential_id: credential.to_string(),
            daily_used: daily_used.unwrap_or(0),
            daily_window_id: QuotaPeriod::Daily.window_id(now),
            daily_reset_at: QuotaPeriod::Daily.reset_at(now),
            monthly_used: monthly_used.unwrap_or(0),
            monthly_window_id: QuotaPeriod::Monthly.window_id(now),
            monthly_reset_at: QuotaPeriod::Monthly.reset_at(now),
            last_request_time: last_request
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        })
    }

    /// Config, usage and remaining for the admin API.
    pub async fn quota_status(&self, credential: &str) -> Result<QuotaStatus, StoreError> {
        let config = self.configs.resolve(credential);
        let usage = self.get_usage(credential).await?;
        let remaining = Remaining::of(&config, usage.daily_used, usage.monthly_used);
        Ok(QuotaStatus {
            config,
            usage,
            remaining,
        })
    }

    /// Clear current-window counters. Returns how many keys existed.
    pub async fn reset_usage(
        &self,
        credential: &str,
        period: ResetPeriod,
    ) -> Result<usize, StoreError> {
        let store = self.store()?;
        let now = self.clock.now();
        let mut keys = Vec::with_capacity(3);
        if matches!(period, ResetPeriod::Daily | ResetPeriod::All) {
            keys.push(QuotaPeriod::Daily.usage_key(credential, now));
        }
        if matches!(period, ResetPeriod::Monthly | ResetPeriod::All) {
            keys.push(QuotaPeriod::Monthly.usage_key(credential, now));
        }
        if period == ResetPeriod::All {
            keys.push(windows::last_request_key(credential));
        }

        let removed = store::with_timeout(STORE_TIMEOUT, store.delete(&keys)).await?;
        tracing::info!(
            credential = %credential_prefix(credential),
            period = ?period,
            removed,
            "Quota usage reset"
        );
        Ok(removed)
    }

    async fn current_usage(&self) -> Result<HashMap<String, CurrentUsage>, StoreError> {
        let store = self.store()?;
        let now = self.clock.now();
        let daily_window = QuotaPeriod::Daily.window_id(now);
        let monthly_window = QuotaPeriod::Monthly.window_id(now);

        let entries =
            store::with_timeout(STORE_TIMEOUT, store.scan_prefix(windows::key_prefix())).await?;
        let mut usage: HashMap<String, CurrentUsage> = HashMap::new();
        for (key, value) in entries {
            let Some(parsed) = windows::parse_usage_key(&key) else {
                continue;
            };
            let current = match parsed.period {
                QuotaPeriod::Daily => parsed.window_id == daily_window,
                QuotaPeriod::Monthly => parsed.window_id == monthly_window,
            };
            if !current {
                continue;
            }
            let slot = usage.entry(parsed.credential).or_default();
            match parsed.period {
                QuotaPeriod::Daily => slot.daily = value,
                QuotaPeriod::Monthly => slot.monthly = value,
            }
        }
        Ok(usage)
    }

    /// Credentials with usage in the current windows, busiest first.
    pub async fn usage_report(
        &self,
        sort_by: QuotaPeriod,
        limit: usize,
        offset: usize,
    ) -> Result<UsageReport, StoreError> {
        let mut rows: Vec<(String, CurrentUsage)> = self.current_usage().await?.into_iter().collect();
        rows.sort_by(|(a_id, a), (b_id, b)| {
            let (a_key, b_key) = match sort_by {
                QuotaPeriod::Daily => ((a.daily, a.monthly), (b.daily, b.monthly)),
                QuotaPeriod::Monthly => ((a.monthly, a.daily), (b.monthly, b.daily)),
            };
            b_key.cmp(&a_key).then_with(|| a_id.cmp(b_id))
        });

        let total = rows.len();
        let entries = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(credential, usage)| {
                let config = self.configs.resolve(&credential);
                UsageReportEntry {
                    credential_id: credential,
                    daily_used: usage.daily,
                    monthly_used: usage.monthly,
                    daily_limit: config.daily_limit,
                    monthly_limit: config.monthly_limit,
                }
            })
            .collect();

        Ok(UsageReport {
            total,
            offset,
            limit,
            sort_by,
            entries,
        })
    }

    /// Current-window usage of every credential, for durable sync.
    pub async fn usage_snapshots(&self) -> Result<Vec<UsageSnapshot>, StoreError> {
        let store = self.store()?;
        let now = self.clock.now();
        let usage = self.current_usage().await?;
        let mut snapshots = Vec::with_capacity(usage.len());
        for (credential, counts) in usage {
            let last_request_key = windows::last_request_key(&credential);
            let last_request_time =
                store::with_timeout(STORE_TIMEOUT, store.get(&last_request_key))
                    .await?
                    .and_then(|secs| i64::try_from(secs).ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            snapshots.push(UsageSnapshot {
                credential_id: credential,
                daily_count: counts.daily,
                daily_window_id: QuotaPeriod::Daily.window_id(now),
                monthly_count: counts.monthly,
                monthly_window_id: QuotaPeriod::Monthly.window_id(now),
                last_request_time,
                synced_at: now,
            });
        }
        snapshots.sort_by(|a, b| a.credential_id.cmp(&b.credential_id));
        Ok(snapshots)
    }

    pub fn get_quota_config(&self, credential: &str) -> QuotaConfig {
        self.configs.resolve(credential)
    }

    pub fn set_quota_config(
        &self,
        credential: &str,
        update: &QuotaConfigUpdate,
    ) -> Result<QuotaConfig, RepositoryError> {
        self.configs.update(credential, update)
    }

    pub fn delete_quota_config(&self, credential: &str) -> Result<bool, RepositoryError> {
        self.configs.delete(credential)
    }

    /// Seconds until the window of `period` resets.
    pub fn seconds_until_reset(&self, period: QuotaPeriod) -> u64 {
        let now = self.clock.now();
        (period.reset_at(now) - now).num_seconds().max(0) as u64
    }
}

/// Highest usage ratio across limited windows; unlimited or zero limits contribute 0.
pub fn usage_ratio(config: &QuotaConfig, daily_used: u64, monthly_used: u64) -> f64 {
    let ratio = |used: u64, limit: Option<u64>| match limit {
        Some(limit) if limit > 0 => used as f64 / limit as f64,
        _ => 0.0,
    };
    ratio(daily_used, config.daily_limit).max(ratio(monthly_used, config.monthly_limit))
}
