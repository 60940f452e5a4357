//! Token accounts and the append-only ledger.
//!
//! A [`TokenAccount`] balance is always the signed sum of the user's
//! [`LedgerEntry`] rows. Entries are immutable; the only way to change a
//! balance is to append an entry, and every entry carries an
//! [`IdempotencyKey`] that is unique across the whole ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{EntryId, JobId, UserId};

/// Kind of balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Debit,
    Credit,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Debit => "debit",
            EntryKind::Credit => "credit",
            EntryKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(EntryKind::Debit),
            "credit" => Some(EntryKind::Credit),
            "refund" => Some(EntryKind::Refund),
            _ => None,
        }
    }

    /// Whether entries of this kind increase the balance.
    pub fn is_inflow(&self) -> bool {
        matches!(self, EntryKind::Credit | EntryKind::Refund)
    }
}

/// Unique key of the logical cause behind a ledger entry.
///
/// Keys are namespaced so the debit and the refund of the same job never
/// collide, while a second refund of that job always does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn debit(job_id: JobId) -> Self {
        Self(format!("debit:{job_id}"))
    }

    pub fn refund(job_id: JobId) -> Self {
        Self(format!("refund:{job_id}"))
    }

    pub fn payment(event_id: &str) -> Self {
        Self(format!("payment:{event_id}"))
    }

    pub fn grant(key: &str) -> Self {
        Self(format!("grant:{key}"))
    }

    /// Wrap a key that was already namespaced (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable record of one balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub kind: EntryKind,
    /// Always positive; direction comes from `kind`.
    pub amount: u64,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: UserId,
        kind: EntryKind,
        amount: u64,
        idempotency_key: IdempotencyKey,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            user_id,
            kind,
            amount,
            idempotency_key,
            created_at,
        }
    }

    /// Balance delta of this entry.
    pub fn signed_amount(&self) -> i128 {
        if self.kind.is_inflow() {
            self.amount as i128
        } else {
            -(self.amount as i128)
        }
    }
}

/// One account per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub user_id: UserId,
    pub balance: u64,
    pub updated_at: DateTime<Utc>,
}

impl TokenAccount {
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: 0,
            updated_at: now,
        }
    }
}

/// Sum a user's entries into a balance (used to audit the invariant).
pub fn replay_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i128 {
    entries.into_iter().map(LedgerEntry::signed_amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_and_refund_keys_do_not_collide() {
        let job = JobId::new();
        assert_ne!(IdempotencyKey::debit(job), IdempotencyKey::refund(job));
        assert_eq!(IdempotencyKey::refund(job), IdempotencyKey::refund(job));
    }

    #[test]
    fn replay_sums_signed_entries() {
        let user = UserId::new();
        let now = Utc::now();
        let entries = vec![
            LedgerEntry::new(user, EntryKind::Credit, 50, IdempotencyKey::payment("evt_1"), now),
            LedgerEntry::new(user, EntryKind::Debit, 10, IdempotencyKey::debit(JobId::new()), now),
            LedgerEntry::new(
                user,
                EntryKind::Refund,
                10,
                IdempotencyKey::refund(JobId::new()),
                now,
            ),
        ];
        assert_eq!(replay_balance(&entries), 50);
    }

    #[test]
    fn entry_kind_parses_its_own_names() {
        for kind in [EntryKind::Debit, EntryKind::Credit, EntryKind::Refund] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("bonus"), None);
    }
}
