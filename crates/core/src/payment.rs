//! Payment-completion notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;

/// A verified payment-completion event from the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Provider's unique session/event identifier.
    pub event_id: String,
    pub user_id: UserId,
    pub tokens: u64,
}

impl PaymentEvent {
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_id.trim().is_empty() {
            return Err(DomainError::validation("event_id must not be empty"));
        }
        if self.tokens == 0 {
            return Err(DomainError::validation("tokens must be positive"));
        }
        Ok(())
    }
}

/// Idempotency record of a processed payment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub user_id: UserId,
    pub tokens: u64,
    pub processed_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn from_payment(event: &PaymentEvent, processed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id.clone(),
            user_id: event.user_id,
            tokens: event.tokens,
            processed_at,
        }
    }
}
