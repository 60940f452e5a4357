//! In-memory store for tests/dev.
//!
//! All state sits behind one mutex, so each trait method is trivially atomic.
//! The lock is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tokenmill_core::{
    EntryKind, ErrorInfo, ExpectedVersion, GenerationJob, IdempotencyKey, JobId, JobStatus,
    LedgerEntry, TokenAccount, UsageKey, UserId, WebhookEvent,
};

use super::{
    ClaimOutcome, CreateJobOutcome, CreditOutcome, DebitOutcome, JobStore, LedgerStore,
    RefundOutcome, StoreError, TransitionOutcome, UsageOutcome, UsageStore, WebhookOutcome,
    WebhookStore,
};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<UserId, TokenAccount>,
    entries: Vec<LedgerEntry>,
    keys: HashSet<IdempotencyKey>,
    jobs: HashMap<JobId, GenerationJob>,
    usage: HashMap<UsageKey, u64>,
    webhooks: HashMap<String, WebhookEvent>,
}

impl State {
    fn balance(&self, user_id: UserId) -> u64 {
        self.accounts.get(&user_id).map(|a| a.balance).unwrap_or(0)
    }

    /// Append an entry and move the balance. Callers check the key and the
    /// funds first.
    fn apply(&mut self, entry: LedgerEntry) -> u64 {
        let now = entry.created_at;
        let account = self
            .accounts
            .entry(entry.user_id)
            .or_insert_with(|| TokenAccount::empty(entry.user_id, now));
        account.balance = if entry.kind.is_inflow() {
            account.balance.saturating_add(entry.amount)
        } else {
            account.balance.saturating_sub(entry.amount)
        };
        account.updated_at = now;
        let balance = account.balance;

        self.keys.insert(entry.idempotency_key.clone());
        self.entries.push(entry);
        balance
    }

    fn debit(
        &mut self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> DebitOutcome {
        if self.keys.contains(key) {
            return DebitOutcome::AlreadyApplied;
        }
        let available = self.balance(user_id);
        if available < amount {
            return DebitOutcome::InsufficientFunds { available };
        }
        let entry = LedgerEntry::new(user_id, EntryKind::Debit, amount, key.clone(), now);
        let balance = self.apply(entry);
        DebitOutcome::Applied { balance }
    }

    fn credit(
        &mut self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> CreditOutcome {
        if self.keys.contains(key) {
            return CreditOutcome::AlreadyApplied;
        }
        let entry = LedgerEntry::new(user_id, EntryKind::Credit, amount, key.clone(), now);
        let balance = self.apply(entry);
        CreditOutcome::Applied { balance }
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut GenerationJob, StoreError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    fn sorted_jobs<F>(&self, mut filter: F, limit: usize) -> Vec<GenerationJob>
    where
        F: FnMut(&GenerationJob) -> bool,
    {
        let mut result: Vec<_> = self.jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by_key(|j| (j.claimed_at.unwrap_or(j.created_at), j.created_at));
        result.truncate(limit);
        result
    }
}

/// In-memory [`super::Store`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    /// Every ledger entry of every user, in append order.
    pub fn all_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.state()?.entries.clone())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn account(&self, user_id: UserId) -> Result<Option<TokenAccount>, StoreError> {
        Ok(self.state()?.accounts.get(&user_id).cloned())
    }

    async fn entries(&self, user_id: UserId, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state()?;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn debit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, StoreError> {
        Ok(self.state()?.debit(user_id, amount, key, now))
    }

    async fn credit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError> {
        Ok(self.state()?.credit(user_id, amount, key, now))
    }

    async fn refund_job(
        &self,
        job_id: JobId,
        user_id: UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, StoreError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;

        if job.user_id != user_id || job.cost != amount {
            return Err(StoreError::Conflict(format!(
                "refund of job {job_id} does not match its owner or cost"
            )));
        }
        if job.status != JobStatus::Failed {
            return Ok(RefundOutcome::NotRefundable { status: job.status });
        }
        if job.refunded {
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let key = IdempotencyKey::refund(job_id);
        if state.keys.contains(&key) {
            return Err(StoreError::Conflict(format!(
                "refund entry for job {job_id} exists but the job is not marked refunded"
            )));
        }

        state
            .job_mut(job_id)?
            .mark_refunded(now)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let balance = state.apply(LedgerEntry::new(user_id, EntryKind::Refund, amount, key, now));
        Ok(RefundOutcome::Refunded { balance })
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job_with_debit(
        &self,
        job: &GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<CreateJobOutcome, StoreError> {
        let mut state = self.state()?;
        if state.jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.job_id)));
        }

        match state.debit(job.user_id, job.cost, &IdempotencyKey::debit(job.job_id), now) {
            DebitOutcome::Applied { balance } => {
                state.jobs.insert(job.job_id, job.clone());
                Ok(CreateJobOutcome::Created { balance })
            }
            DebitOutcome::InsufficientFunds { available } => {
                Ok(CreateJobOutcome::InsufficientFunds { available })
            }
            DebitOutcome::AlreadyApplied => Err(StoreError::Conflict(format!(
                "debit for job {} already recorded",
                job.job_id
            ))),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.state()?.jobs.get(&job_id).cloned())
    }

    async fn claim_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Pending || !expected.matches(job.version) {
            return Ok(ClaimOutcome::Conflict);
        }
        job.claim(now).map_err(|e| StoreError::Conflict(e.to_string()))?;
        Ok(ClaimOutcome::Claimed(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Processing || !expected.matches(job.version) {
            return Ok(TransitionOutcome::Conflict);
        }
        job.complete(result_ref, now)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        error: &ErrorInfo,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Processing || !expected.matches(job.version) {
            return Ok(TransitionOutcome::Conflict);
        }
        job.fail(error.clone(), now)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let state = self.state()?;
        Ok(state.sorted_jobs(
            |j| j.status == JobStatus::Processing && j.claimed_at.is_some_and(|at| at < cutoff),
            limit,
        ))
    }

    async fn refund_due_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>, StoreError> {
        let state = self.state()?;
        Ok(state.sorted_jobs(GenerationJob::refund_due, limit))
    }

    async fn orphaned_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let state = self.state()?;
        Ok(state.sorted_jobs(|j| j.requeue_due(cutoff), limit))
    }

    async fn mark_requeued(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let job = state.job_mut(job_id)?;
        if !job.requeue_due(cutoff) {
            return Ok(false);
        }
        job.mark_requeued(now);
        Ok(true)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn increment_usage(
        &self,
        key: &UsageKey,
        limit: u64,
    ) -> Result<UsageOutcome, StoreError> {
        let mut state = self.state()?;
        let count = state.usage.entry(key.clone()).or_insert(0);
        if *count >= limit {
            return Ok(UsageOutcome::LimitExceeded { count: *count });
        }
        *count += 1;
        Ok(UsageOutcome::Accepted { count: *count })
    }

    async fn release_usage(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        match state.usage.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                Ok(*count)
            }
            None => Ok(0),
        }
    }

    async fn usage_count(&self, key: &UsageKey) -> Result<u64, StoreError> {
        Ok(self.state()?.usage.get(key).copied().unwrap_or(0))
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn record_payment(&self, event: &WebhookEvent) -> Result<WebhookOutcome, StoreError> {
        let mut state = self.state()?;
        if state.webhooks.contains_key(&event.event_id) {
            return Ok(WebhookOutcome::Duplicate);
        }

        let key = IdempotencyKey::payment(&event.event_id);
        let balance = match state.credit(event.user_id, event.tokens, &key, event.processed_at) {
            CreditOutcome::Applied { balance } => balance,
            CreditOutcome::AlreadyApplied => state.balance(event.user_id),
        };
        state.webhooks.insert(event.event_id.clone(), event.clone());
        Ok(WebhookOutcome::Processed { balance })
    }
}
