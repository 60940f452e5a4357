//! `tokenmill-core` — domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the ledger model, the generation-job state machine, usage
//! counter addressing and the feature catalog.

pub mod catalog;
pub mod error;
pub mod id;
pub mod job;
pub mod ledger;
pub mod payment;
pub mod usage;
pub mod version;

pub use catalog::{FeatureCatalog, FeatureSpec, SubscriptionTier, TierLimits};
pub use error::{DomainError, DomainResult};
pub use id::{EntryId, JobId, UserId};
pub use job::{ErrorInfo, FailureKind, GenerationJob, GenerationRequest, JobStatus};
pub use ledger::{EntryKind, IdempotencyKey, LedgerEntry, TokenAccount, replay_balance};
pub use payment::{PaymentEvent, WebhookEvent};
pub use usage::{Period, PeriodKey, UsageKey};
pub use version::ExpectedVersion;
