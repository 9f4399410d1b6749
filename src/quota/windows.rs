//! UTC calendar windows for quotas.
//!
//! Daily windows are keyed by UTC date (`YYYYMMDD`), monthly windows by UTC
//! year-month (`YYYYMM`). Counter keys outlive their window by a buffer (one day
//! for daily, five days for monthly) so late reads and syncs still see them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const DAILY_TTL_BUFFER: Duration = Duration::from_secs(86_400);
const MONTHLY_TTL_BUFFER: Duration = Duration::from_secs(5 * 86_400);

const KEY_PREFIX: &str = "quota:";
const LAST_REQUEST_SUFFIX: &str = "last_request";

/// Quota horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Monthly => "monthly",
        }
    }

    /// Identifier of the window containing `now`.
    pub fn window_id(&self, now: DateTime<Utc>) -> String {
        match self {
            QuotaPeriod::Daily => now.format("%Y%m%d").to_string(),
            QuotaPeriod::Monthly => now.format("%Y%m").to_string(),
        }
    }

    /// Start of the window after the one containing `now`.
    pub fn reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let next = match self {
            QuotaPeriod::Daily => today.checked_add_days(Days::new(1)),
            QuotaPeriod::Monthly => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
                .and_then(|first| first.checked_add_months(Months::new(1))),
        };
        next.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// TTL for a counter created at `now`: until the window ends, plus the buffer.
    pub fn ttl(&self, now: DateTime<Utc>) -> Duration {
        let until_reset = (self.reset_at(now) - now).to_std().unwrap_or_default();
        let buffer = match self {
            QuotaPeriod::Daily => DAILY_TTL_BUFFER,
            QuotaPeriod::Monthly => MONTHLY_TTL_BUFFER,
        };
        until_reset + buffer
    }

    /// Counter key for `credential` in the window containing `now`.
    pub fn usage_key(&self, credential: &str, now: DateTime<Utc>) -> String {
        format!(
            "{KEY_PREFIX}{credential}:{}:{}",
            self.as_str(),
            self.window_id(now)
        )
    }
}

impl fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(QuotaPeriod::Daily),
            "monthly" => Ok(QuotaPeriod::Monthly),
            other => Err(format!("unknown quota period '{other}'")),
        }
    }
}

/// Key holding the unix time of a credential's last counted request.
pub fn last_request_key(credential: &str) -> String {
    format!("{KEY_PREFIX}{credential}:{LAST_REQUEST_SUFFIX}")
}

/// Prefix shared by every quota key.
pub fn key_prefix() -> &'static str {
    KEY_PREFIX
}

/// A usage counter key taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageKey {
    pub credential: String,
    pub period: QuotaPeriod,
    pub window_id: String,
}

/// Parse `quota:{credential}:{period}:{window}`. Credentials may contain `:`.
pub fn parse_usage_key(key: &str) -> Option<UsageKey> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let mut parts = rest.rsplitn(3, ':');
    let window_id = parts.next()?;
    let period = parts.next()?.parse().ok()?;
    let credential = parts.next()?;
    if credential.is_empty() || !window_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(UsageKey {
        credential: credential.to_string(),
        period,
        window_id: window_id.to_string(),
    })
}
