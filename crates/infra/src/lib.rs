//! `tokenmill-infra` — persistence, queueing and the job pipeline.
//!
//! - `store`: storage seams (`LedgerStore`, `JobStore`, `UsageStore`,
//!   `WebhookStore`) with in-memory and Postgres backends
//! - `queue`: job queue seam with in-memory and Redis Streams backends
//! - `ledger` / `usage` / `webhook`: services over the store
//! - `jobs`: submission, dispatch, workers and failure resolution
//! - `reaper`: periodic recovery of stuck, unrefunded and orphaned jobs
//! - `config`: environment configuration

pub mod config;
pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod usage;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, ConfigError};
pub use ledger::{BalanceView, LedgerError, TokenLedger};
pub use reaper::{ReaperConfig, ReaperHandle, StaleJobReaper, SweepReport};
pub use usage::{UsageLimiter, UsageReservation, UsageSnapshot};
pub use webhook::{HmacSha256Verifier, PaymentWebhookGuard, WebhookError, WebhookSignatureVerifier};
