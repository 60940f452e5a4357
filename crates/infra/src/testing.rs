//! Test doubles shared by the job pipeline tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use tokenmill_core::{
    ErrorInfo, ExpectedVersion, GenerationJob, GenerationRequest, IdempotencyKey, JobId,
    LedgerEntry, TokenAccount, UsageKey, UserId, WebhookEvent,
};

use crate::jobs::generation::{GenerationClient, GenerationError};
use crate::store::{
    ClaimOutcome, CreateJobOutcome, CreditOutcome, DebitOutcome, InMemoryStore, JobStore,
    LedgerStore, RefundOutcome, StoreError, TransitionOutcome, UsageOutcome, UsageStore,
    WebhookOutcome, WebhookStore,
};

/// How the next generation call behaves.
pub enum Step {
    Succeed(&'static str),
    Fail(&'static str),
    Panic,
    /// Wait for [`ScriptedGenerator::release`], then succeed.
    Hang(&'static str),
}

/// Plays back a fixed script; succeeds with `"default"` once it runs out.
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    gate: Notify,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
            gate: Notify::new(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    async fn generate(
        &self,
        _job_id: JobId,
        _request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok("default".to_string()),
            Some(Step::Succeed(r)) => Ok(r.to_string()),
            Some(Step::Fail(msg)) => Err(GenerationError::Rejected(msg.to_string())),
            Some(Step::Panic) => panic!("generator blew up"),
            Some(Step::Hang(r)) => {
                self.gate.notified().await;
                Ok(r.to_string())
            }
        }
    }
}

/// Fund a fresh user and persist a pending job for them.
pub async fn pending_job<S>(store: &S, balance: u64, cost: u64) -> GenerationJob
where
    S: LedgerStore + JobStore,
{
    let user = UserId::new();
    store
        .credit(user, balance, &IdempotencyKey::grant(&format!("seed-{user}")), Utc::now())
        .await
        .unwrap();
    let request = GenerationRequest::new("image", "a red fox");
    let job = GenerationJob::pending(user, request, cost, Utc::now());
    let outcome = store.create_job_with_debit(&job, Utc::now()).await.unwrap();
    assert!(matches!(outcome, CreateJobOutcome::Created { .. }));
    job
}

/// [`InMemoryStore`] whose `fail_job` errors for chosen jobs.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    broken: Mutex<HashSet<JobId>>,
}

impl FlakyStore {
    pub fn break_job(&self, job_id: JobId) {
        self.broken.lock().unwrap().insert(job_id);
    }

    fn is_broken(&self, job_id: JobId) -> bool {
        self.broken.lock().unwrap().contains(&job_id)
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn account(&self, user_id: UserId) -> Result<Option<TokenAccount>, StoreError> {
        self.inner.account(user_id).await
    }

    async fn entries(&self, user_id: UserId, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.entries(user_id, limit).await
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, StoreError> {
        self.inner.debit(user_id, amount, key, now).await
    }

    async fn credit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError> {
        self.inner.credit(user_id, amount, key, now).await
    }

    async fn refund_job(
        &self,
        job_id: JobId,
        user_id: UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, StoreError> {
        self.inner.refund_job(job_id, user_id, amount, now).await
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job_with_debit(
        &self,
        job: &GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<CreateJobOutcome, StoreError> {
        self.inner.create_job_with_debit(job, now).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<GenerationJob>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn claim_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        self.inner.claim_job(job_id, expected, now).await
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.inner.complete_job(job_id, expected, result_ref, now).await
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        error: &ErrorInfo,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        if self.is_broken(job_id) {
            return Err(StoreError::Backend(format!("write to job {job_id} failed")));
        }
        self.inner.fail_job(job_id, expected, error, now).await
    }

    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        self.inner.stale_jobs(cutoff, limit).await
    }

    async fn refund_due_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>, StoreError> {
        self.inner.refund_due_jobs(limit).await
    }

    async fn orphaned_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        self.inner.orphaned_pending(cutoff, limit).await
    }

    async fn mark_requeued(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.mark_requeued(job_id, cutoff, now).await
    }
}

#[async_trait]
impl UsageStore for FlakyStore {
    async fn increment_usage(
        &self,
        key: &UsageKey,
        limit: u64,
    ) -> Result<UsageOutcome, StoreError> {
        self.inner.increment_usage(key, limit).await
    }

    async fn release_usage(&self, key: &UsageKey) -> Result<u64, StoreError> {
        self.inner.release_usage(key).await
    }

    async fn usage_count(&self, key: &UsageKey) -> Result<u64, StoreError> {
        self.inner.usage_count(key).await
    }
}

#[async_trait]
impl WebhookStore for FlakyStore {
    async fn record_payment(&self, event: &WebhookEvent) -> Result<WebhookOutcome, StoreError> {
        self.inner.record_payment(event).await
    }
}
