//! Token ledger service.
//!
//! Thin layer over [`LedgerStore`]: amount validation, namespaced keys and
//! logging. Atomicity lives in the store.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use tokenmill_core::{IdempotencyKey, JobId, LedgerEntry, UserId};

use crate::store::{CreditOutcome, DebitOutcome, RefundOutcome, Store, StoreError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("amount must be positive")]
    ZeroAmount,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Balance plus recent activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceView {
    pub user_id: UserId,
    pub balance: u64,
    pub recent: Vec<LedgerEntry>,
}

#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<dyn Store>,
}

impl TokenLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn debit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<DebitOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let outcome = self.store.debit(user_id, amount, key, Utc::now()).await?;
        debug!(user_id = %user_id, key = %key, outcome = ?outcome, "debit");
        Ok(outcome)
    }

    pub async fn credit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<CreditOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let outcome = self.store.credit(user_id, amount, key, Utc::now()).await?;
        if outcome == CreditOutcome::AlreadyApplied {
            info!(user_id = %user_id, key = %key, "credit already applied");
        }
        Ok(outcome)
    }

    /// Refund a failed job's cost. At most one refund per job.
    pub async fn refund(
        &self,
        job_id: JobId,
        user_id: UserId,
        amount: u64,
    ) -> Result<RefundOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let outcome = self.store.refund_job(job_id, user_id, amount, Utc::now()).await?;
        debug!(job_id = %job_id, user_id = %user_id, outcome = ?outcome, "refund");
        Ok(outcome)
    }

    /// Promotional or support credit, keyed by the caller.
    pub async fn grant(
        &self,
        user_id: UserId,
        amount: u64,
        grant_key: &str,
    ) -> Result<CreditOutcome, LedgerError> {
        self.credit(user_id, amount, &IdempotencyKey::grant(grant_key)).await
    }

    /// Users without an account have a zero balance.
    pub async fn balance(&self, user_id: UserId) -> Result<u64, LedgerError> {
        Ok(self
            .store
            .account(user_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0))
    }

    pub async fn view(&self, user_id: UserId, recent: usize) -> Result<BalanceView, LedgerError> {
        let balance = self.balance(user_id).await?;
        let recent = self.store.entries(user_id, recent).await?;
        Ok(BalanceView {
            user_id,
            balance,
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use tokenmill_core::{EntryKind, replay_balance};

    fn ledger() -> (TokenLedger, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (TokenLedger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn zero_amounts_are_rejected() {
        let (ledger, _) = ledger();
        let user = UserId::new();
        assert_eq!(
            ledger.grant(user, 0, "promo").await,
            Err(LedgerError::ZeroAmount)
        );
        assert_eq!(
            ledger.debit(user, 0, &IdempotencyKey::grant("x")).await,
            Err(LedgerError::ZeroAmount)
        );
    }

    #[tokio::test]
    async fn grant_is_idempotent_per_key() {
        let (ledger, _) = ledger();
        let user = UserId::new();
        assert_eq!(
            ledger.grant(user, 25, "welcome").await.unwrap(),
            CreditOutcome::Applied { balance: 25 }
        );
        assert_eq!(
            ledger.grant(user, 25, "welcome").await.unwrap(),
            CreditOutcome::AlreadyApplied
        );
        assert_eq!(ledger.balance(user).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn view_lists_recent_entries_newest_first() {
        let (ledger, _) = ledger();
        let user = UserId::new();
        ledger.grant(user, 30, "a").await.unwrap();
        ledger
            .debit(user, 5, &IdempotencyKey::grant("spend"))
            .await
            .unwrap();

        let view = ledger.view(user, 10).await.unwrap();
        assert_eq!(view.balance, 25);
        assert_eq!(view.recent[0].kind, EntryKind::Debit);
        assert_eq!(replay_balance(&view.recent), 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_never_overdraw() {
        let (ledger, store) = ledger();
        let user = UserId::new();
        ledger.grant(user, 100, "seed").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .debit(user, 7, &IdempotencyKey::grant(&format!("spend-{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for h in handles {
            if let DebitOutcome::Applied { .. } = h.await.unwrap() {
                applied += 1;
            }
        }

        assert_eq!(applied, 100 / 7);
        let balance = ledger.balance(user).await.unwrap();
        assert_eq!(balance, 100 - 7 * applied);
        assert_eq!(replay_balance(&store.all_entries().unwrap()), balance as i128);
    }
}
