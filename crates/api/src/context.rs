use tokenmill_core::{SubscriptionTier, UserId};

/// Caller identity for a request, derived from the bearer token.
///
/// Must be present for every protected route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
    tier: SubscriptionTier,
}

impl UserContext {
    pub fn new(user_id: UserId, tier: SubscriptionTier) -> Self {
        Self { user_id, tier }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn tier(&self) -> SubscriptionTier {
        self.tier
    }
}
