//! Usage counter addressing.
//!
//! Counters are never reset. A new period is a new key, so the count for it
//! implicitly starts at zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Reset granularity of a usage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Monthly,
}

impl Period {
    pub fn key_for(&self, at: DateTime<Utc>) -> PeriodKey {
        match self {
            Period::Daily => PeriodKey(at.format("%Y-%m-%d").to_string()),
            Period::Monthly => PeriodKey(at.format("%Y-%m").to_string()),
        }
    }
}

/// Encoded period, e.g. `2026-10-15` for a daily limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of one usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub user_id: UserId,
    pub feature_id: String,
    pub period_key: PeriodKey,
}

impl UsageKey {
    pub fn new(user_id: UserId, feature_id: impl Into<String>, period_key: PeriodKey) -> Self {
        Self {
            user_id,
            feature_id: feature_id.into(),
            period_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_keys_follow_granularity() {
        let at = Utc.with_ymd_and_hms(2026, 10, 15, 23, 59, 0).unwrap();
        assert_eq!(Period::Daily.key_for(at).as_str(), "2026-10-15");
        assert_eq!(Period::Monthly.key_for(at).as_str(), "2026-10");
    }

    #[test]
    fn next_day_is_a_new_key() {
        let today = Utc.with_ymd_and_hms(2026, 10, 15, 23, 59, 0).unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 1).unwrap();
        assert_ne!(Period::Daily.key_for(today), Period::Daily.key_for(tomorrow));
        assert_eq!(Period::Monthly.key_for(today), Period::Monthly.key_for(tomorrow));
    }
}
