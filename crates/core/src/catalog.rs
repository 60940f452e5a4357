//! Billable features, their prices and per-tier usage limits.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::usage::Period;

/// Subscription tier of a user (carried in the auth claims).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Studio,
}

/// Per-tier action limit for one feature and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free: u64,
    pub pro: u64,
    pub studio: u64,
}

impl TierLimits {
    pub fn for_tier(&self, tier: SubscriptionTier) -> u64 {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Studio => self.studio,
        }
    }
}

/// One billable feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: String,
    /// Tokens debited per job.
    pub cost: u64,
    pub period: Period,
    pub limits: TierLimits,
}

/// The set of features the front door accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCatalog {
    pub features: Vec<FeatureSpec>,
}

impl FeatureCatalog {
    pub fn new(features: Vec<FeatureSpec>) -> DomainResult<Self> {
        for (idx, f) in features.iter().enumerate() {
            if f.id.trim().is_empty() {
                return Err(DomainError::validation(format!("feature #{idx} has an empty id")));
            }
            if f.cost == 0 {
                return Err(DomainError::validation(format!(
                    "feature {} must cost at least 1 token",
                    f.id
                )));
            }
            if features[..idx].iter().any(|other| other.id == f.id) {
                return Err(DomainError::validation(format!("duplicate feature id {}", f.id)));
            }
        }
        Ok(Self { features })
    }

    pub fn get(&self, id: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn require(&self, id: &str) -> DomainResult<&FeatureSpec> {
        self.get(id)
            .ok_or_else(|| DomainError::validation(format!("unknown feature: {id}")))
    }
}

impl Default for FeatureCatalog {
    fn default() -> Self {
        Self {
            features: vec![
                FeatureSpec {
                    id: "image".to_string(),
                    cost: 10,
                    period: Period::Daily,
                    limits: TierLimits { free: 5, pro: 100, studio: 1000 },
                },
                FeatureSpec {
                    id: "video".to_string(),
                    cost: 40,
                    period: Period::Daily,
                    limits: TierLimits { free: 1, pro: 20, studio: 200 },
                },
                FeatureSpec {
                    id: "upscale".to_string(),
                    cost: 4,
                    period: Period::Monthly,
                    limits: TierLimits { free: 30, pro: 1000, studio: 10000 },
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_is_valid() {
        let default = FeatureCatalog::default();
        assert!(FeatureCatalog::new(default.features.clone()).is_ok());
        assert_eq!(default.require("image").unwrap().cost, 10);
        assert_eq!(default.require("image").unwrap().limits.for_tier(SubscriptionTier::Free), 5);
    }

    #[test]
    fn rejects_duplicates_and_free_features() {
        let mut features = FeatureCatalog::default().features;
        features.push(features[0].clone());
        assert!(FeatureCatalog::new(features).is_err());

        let mut free = FeatureCatalog::default().features;
        free[0].cost = 0;
        assert!(FeatureCatalog::new(free).is_err());
    }

    #[test]
    fn unknown_feature_is_a_validation_error() {
        let catalog = FeatureCatalog::default();
        assert!(matches!(catalog.require("audio"), Err(DomainError::Validation(_))));
    }
}
