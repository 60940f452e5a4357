//! Payment webhook intake.
//!
//! Signature check, then an idempotent insert of the event together with its
//! credit. Redeliveries of a processed event are acknowledged without effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use tokenmill_core::{PaymentEvent, WebhookEvent};

use crate::store::{Store, StoreError, WebhookOutcome};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checks that a payload came from the payment provider.
pub trait WebhookSignatureVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// Hex-encoded HMAC-SHA256 of the raw body, optionally prefixed `sha256=`.
#[derive(Clone)]
pub struct HmacSha256Verifier {
    secret: Vec<u8>,
}

impl HmacSha256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, payload: &[u8]) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(payload);
        Some(mac)
    }

    /// Signature the provider would send for `payload`.
    pub fn sign(&self, payload: &[u8]) -> Option<String> {
        let mac = self.mac(payload)?;
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for HmacSha256Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha256Verifier").finish_non_exhaustive()
    }
}

impl WebhookSignatureVerifier for HmacSha256Verifier {
    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let signature = signature.trim();
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        self.mac(payload)
            .is_some_and(|mac| mac.verify_slice(&expected).is_ok())
    }
}

#[derive(Clone)]
pub struct PaymentWebhookGuard {
    store: Arc<dyn Store>,
    verifier: Arc<dyn WebhookSignatureVerifier>,
}

impl PaymentWebhookGuard {
    pub fn new(store: Arc<dyn Store>, verifier: Arc<dyn WebhookSignatureVerifier>) -> Self {
        Self { store, verifier }
    }

    /// Verify, parse and apply a raw delivery.
    pub async fn handle_signed(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        match signature {
            Some(sig) if self.verifier.verify(payload, sig) => {}
            _ => return Err(WebhookError::InvalidSignature),
        }
        let event: PaymentEvent =
            serde_json::from_slice(payload).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        self.handle(event, now).await
    }

    /// Apply an already verified event.
    pub async fn handle(
        &self,
        event: PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        event
            .validate()
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        let outcome = self
            .store
            .record_payment(&WebhookEvent::from_payment(&event, now))
            .await?;

        match outcome {
            WebhookOutcome::Processed { balance } => info!(
                event_id = %event.event_id,
                user_id = %event.user_id,
                tokens = event.tokens,
                balance,
                "payment credited"
            ),
            WebhookOutcome::Duplicate => info!(
                event_id = %event.event_id,
                user_id = %event.user_id,
                "duplicate payment event ignored"
            ),
        }
        Ok(outcome)
    }
}
