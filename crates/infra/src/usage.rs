//! Per-feature usage limiter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use tokenmill_core::{FeatureCatalog, FeatureSpec, PeriodKey, SubscriptionTier, UsageKey, UserId};

use crate::store::{Store, StoreError, UsageOutcome};

/// An accepted action, kept so it can be given back if the debit fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReservation {
    pub key: UsageKey,
    pub count: u64,
    pub limit: u64,
}

/// Current standing for one feature and period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub feature: String,
    pub period_key: PeriodKey,
    pub count: u64,
    pub limit: u64,
}

#[derive(Clone)]
pub struct UsageLimiter {
    store: Arc<dyn Store>,
    catalog: Arc<FeatureCatalog>,
}

impl UsageLimiter {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<FeatureCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Single atomic increment-with-ceiling. `LimitExceeded` leaves the
    /// counter untouched.
    pub async fn check_and_increment(
        &self,
        user_id: UserId,
        feature_id: &str,
        period_key: PeriodKey,
        limit: u64,
    ) -> Result<UsageOutcome, StoreError> {
        let key = UsageKey::new(user_id, feature_id, period_key);
        let outcome = self.store.increment_usage(&key, limit).await?;
        debug!(user_id = %user_id, feature = feature_id, outcome = ?outcome, "usage check");
        Ok(outcome)
    }

    /// Count one action of `feature` for a user of `tier` at `now`.
    ///
    /// `Ok(None)` means the limit is reached.
    pub async fn reserve(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        feature: &FeatureSpec,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageReservation>, StoreError> {
        let period_key = feature.period.key_for(now);
        let limit = feature.limits.for_tier(tier);
        match self
            .check_and_increment(user_id, &feature.id, period_key.clone(), limit)
            .await?
        {
            UsageOutcome::Accepted { count } => Ok(Some(UsageReservation {
                key: UsageKey::new(user_id, feature.id.clone(), period_key),
                count,
                limit,
            })),
            UsageOutcome::LimitExceeded { .. } => Ok(None),
        }
    }

    /// Give back a reservation whose action did not go through.
    pub async fn release(&self, reservation: &UsageReservation) {
        if let Err(err) = self.store.release_usage(&reservation.key).await {
            warn!(
                user_id = %reservation.key.user_id,
                feature = %reservation.key.feature_id,
                error = %err,
                "failed to release usage reservation"
            );
        }
    }

    pub async fn snapshot(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        feature_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageSnapshot>, StoreError> {
        let Some(feature) = self.catalog.get(feature_id) else {
            return Ok(None);
        };
        let period_key = feature.period.key_for(now);
        let key = UsageKey::new(user_id, feature.id.clone(), period_key.clone());
        let count = self.store.usage_count(&key).await?;
        Ok(Some(UsageSnapshot {
            feature: feature.id.clone(),
            period_key,
            count,
            limit: feature.limits.for_tier(tier),
        }))
    }
}
