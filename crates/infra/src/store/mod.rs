//! Persistent store boundary.
//!
//! Every method is one atomic conditional operation: a guarded update, an
//! increment with a ceiling, or an insert-if-absent. Services never read a
//! record and write it back; the store decides.
//!
//! ## Components
//!
//! - [`LedgerStore`]: token accounts and the append-only ledger
//! - [`JobStore`]: generation jobs and their guarded transitions
//! - [`UsageStore`]: per-period usage counters
//! - [`WebhookStore`]: processed payment events
//! - [`Store`]: all of the above, which is what services hold

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tokenmill_core::{
    ErrorInfo, ExpectedVersion, GenerationJob, IdempotencyKey, JobId, JobStatus, LedgerEntry,
    TokenAccount, UsageKey, UserId, WebhookEvent,
};

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Store operation error.
///
/// Business outcomes (insufficient funds, duplicates, lost races) are not
/// errors; they come back as outcome enums.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// The request contradicts what is stored (e.g. refund amount differs from job cost).
    #[error("conflicting request: {0}")]
    Conflict(String),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result of a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied { balance: u64 },
    InsufficientFunds { available: u64 },
    /// The idempotency key was already used; nothing changed.
    AlreadyApplied,
}

/// Result of a credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { balance: u64 },
    AlreadyApplied,
}

/// Result of refunding a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { balance: u64 },
    AlreadyRefunded,
    /// Only failed jobs can be refunded.
    NotRefundable { status: JobStatus },
}

/// Result of creating a job together with its debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateJobOutcome {
    Created { balance: u64 },
    InsufficientFunds { available: u64 },
}

/// Result of claiming a pending job.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(GenerationJob),
    /// Someone else claimed it first, or the version moved on.
    Conflict,
}

/// Result of resolving an in-flight job.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(GenerationJob),
    /// The job is no longer `Processing` at the expected version.
    Conflict,
}

impl TransitionOutcome {
    pub fn applied(self) -> Option<GenerationJob> {
        match self {
            TransitionOutcome::Applied(job) => Some(job),
            TransitionOutcome::Conflict => None,
        }
    }
}

/// Result of counting one action against a usage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    Accepted { count: u64 },
    /// The counter was left untouched.
    LimitExceeded { count: u64 },
}

/// Result of recording a payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { balance: u64 },
    Duplicate,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn account(&self, user_id: UserId) -> Result<Option<TokenAccount>, StoreError>;

    /// Most recent entries first.
    async fn entries(&self, user_id: UserId, limit: usize) -> Result<Vec<LedgerEntry>, StoreError>;

    /// `balance >= amount` check, decrement and Debit entry as one step.
    async fn debit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, StoreError>;

    /// Increment and Credit entry, only if `key` is new.
    async fn credit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError>;

    /// Flip the job's `refunded` flag, write the Refund entry (keyed
    /// `refund:<job_id>`) and credit the balance, all or nothing.
    ///
    /// `user_id` and `amount` must match the job's owner and cost.
    async fn refund_job(
        &self,
        job_id: JobId,
        user_id: UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Debit `job.cost` under `debit:<job_id>` and insert the pending job.
    /// On insufficient funds neither happens.
    async fn create_job_with_debit(
        &self,
        job: &GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<CreateJobOutcome, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<GenerationJob>, StoreError>;

    /// Pending -> Processing iff status is Pending and the version matches.
    async fn claim_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Processing -> Completed iff status is Processing and the version matches.
    async fn complete_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Processing -> Failed iff status is Processing and the version matches.
    /// The refund is a separate call.
    async fn fail_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        error: &ErrorInfo,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Processing jobs claimed before `cutoff`, oldest claim first.
    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError>;

    /// Failed jobs whose refund has not landed.
    async fn refund_due_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>, StoreError>;

    /// Pending jobs last enqueued (created or re-enqueued) before `cutoff`.
    async fn orphaned_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError>;

    /// Stamp `requeued_at = now` iff the job is still Pending and was last
    /// enqueued before `cutoff`. `false` when the job moved on or another
    /// sweep already stamped it.
    async fn mark_requeued(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Increment iff the current count is below `limit`.
    async fn increment_usage(&self, key: &UsageKey, limit: u64) -> Result<UsageOutcome, StoreError>;

    /// Give back one accepted action (never below zero). Returns the new count.
    async fn release_usage(&self, key: &UsageKey) -> Result<u64, StoreError>;

    async fn usage_count(&self, key: &UsageKey) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Insert the event if absent and credit `payment:<event_id>` in the
    /// same atomic unit.
    async fn record_payment(&self, event: &WebhookEvent) -> Result<WebhookOutcome, StoreError>;
}

/// Everything services need from persistence.
pub trait Store: LedgerStore + JobStore + UsageStore + WebhookStore {}

impl<T> Store for T where T: LedgerStore + JobStore + UsageStore + WebhookStore {}
