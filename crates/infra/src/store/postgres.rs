//! Postgres-backed store implementation.
//!
//! Every trait method is a single statement or a single transaction, and every
//! state change is a conditional write (`UPDATE ... WHERE <guard> RETURNING`,
//! `INSERT ... ON CONFLICT DO NOTHING RETURNING`). An empty `RETURNING` means
//! the guard did not hold; the method then reads the row only to explain why.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / Tls / Other | N/A | `Backend` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use tokenmill_core::{
    EntryId, EntryKind, ErrorInfo, ExpectedVersion, FailureKind, GenerationJob, GenerationRequest,
    IdempotencyKey, JobId, JobStatus, LedgerEntry, TokenAccount, UsageKey, UserId, WebhookEvent,
};

use super::{
    ClaimOutcome, CreateJobOutcome, CreditOutcome, DebitOutcome, JobStore, LedgerStore,
    RefundOutcome, StoreError, TransitionOutcome, UsageOutcome, UsageStore, WebhookOutcome,
    WebhookStore,
};

const SCHEMA: &str = include_str!("../../migrations/0001_tokenmill.sql");

macro_rules! job_columns {
    () => {
        "job_id, user_id, feature, status, cost, request, result_ref, error_kind, \
         error_message, claimed_at, attempt, refunded, version, requeued_at, created_at, \
         updated_at"
    };
}

/// Postgres-backed [`super::Store`].
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn job_exists(&self, job_id: JobId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM generation_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;
        Ok(row.is_some())
    }

    async fn missing_or_conflict<T>(&self, job_id: JobId, conflict: T) -> Result<T, StoreError> {
        if self.job_exists(job_id).await? {
            Ok(conflict)
        } else {
            Err(StoreError::NotFound(format!("job {job_id}")))
        }
    }

    async fn jobs_where(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn account(&self, user_id: UserId) -> Result<Option<TokenAccount>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, balance, updated_at
            FROM token_accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account", e))?;

        row.map(|row| {
            let row = AccountRow::from_row(&row).map_err(|e| map_sqlx_error("account", e))?;
            row.try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn entries(&self, user_id: UserId, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, user_id, kind, amount, idempotency_key, created_at
            FROM ledger_entries
            WHERE user_id = $1
            ORDER BY created_at DESC, entry_id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(limit_param(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries", e))?;

        rows.iter()
            .map(|row| {
                EntryRow::from_row(row)
                    .map_err(|e| map_sqlx_error("entries", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id, key = %key), err)]
    async fn debit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let outcome = debit_in(&mut tx, user_id, amount, key, now).await?;
        finish(tx, matches!(outcome, DebitOutcome::Applied { .. })).await?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(user_id = %user_id, key = %key), err)]
    async fn credit(
        &self,
        user_id: UserId,
        amount: u64,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let entry = LedgerEntry::new(user_id, EntryKind::Credit, amount, key.clone(), now);
        let outcome = match credit_in(&mut tx, &entry).await? {
            Some(balance) => CreditOutcome::Applied { balance },
            None => CreditOutcome::AlreadyApplied,
        };
        finish(tx, matches!(outcome, CreditOutcome::Applied { .. })).await?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(job_id = %job_id, user_id = %user_id), err)]
    async fn refund_job(
        &self,
        job_id: JobId,
        user_id: UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let flipped = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET refunded = TRUE, version = version + 1, updated_at = $2
            WHERE job_id = $1
              AND status = 'failed'
              AND refunded = FALSE
              AND user_id = $3
              AND cost = $4
            RETURNING job_id
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(user_id.as_uuid())
        .bind(to_db(amount, "refund amount")?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("refund_flag", e))?;

        if flipped.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;

            let job = self
                .get_job(job_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
            if job.user_id != user_id || job.cost != amount {
                return Err(StoreError::Conflict(format!(
                    "refund of job {job_id} does not match its owner or cost"
                )));
            }
            return Ok(if job.status != JobStatus::Failed {
                RefundOutcome::NotRefundable { status: job.status }
            } else {
                RefundOutcome::AlreadyRefunded
            });
        }

        let entry = LedgerEntry::new(
            user_id,
            EntryKind::Refund,
            amount,
            IdempotencyKey::refund(job_id),
            now,
        );
        let Some(balance) = credit_in(&mut tx, &entry).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict(format!(
                "refund entry for job {job_id} exists but the job is not marked refunded"
            )));
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(RefundOutcome::Refunded { balance })
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, user_id = %job.user_id), err)]
    async fn create_job_with_debit(
        &self,
        job: &GenerationJob,
        now: DateTime<Utc>,
    ) -> Result<CreateJobOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let key = IdempotencyKey::debit(job.job_id);
        let balance = match debit_in(&mut tx, job.user_id, job.cost, &key, now).await? {
            DebitOutcome::Applied { balance } => balance,
            DebitOutcome::InsufficientFunds { available } => {
                finish(tx, false).await?;
                return Ok(CreateJobOutcome::InsufficientFunds { available });
            }
            DebitOutcome::AlreadyApplied => {
                finish(tx, false).await?;
                return Err(StoreError::Conflict(format!(
                    "debit for job {} already recorded",
                    job.job_id
                )));
            }
        };

        let request = serde_json::to_value(&job.request)
            .map_err(|e| StoreError::Corrupt(format!("failed to encode request: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO generation_jobs (
                job_id, user_id, feature, status, cost, request,
                attempt, refunded, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $9, $10)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.feature())
        .bind(job.status.as_str())
        .bind(to_db(job.cost, "cost")?)
        .bind(&request)
        .bind(job.attempt as i32)
        .bind(to_db(job.version, "version")?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CreateJobOutcome::Created { balance })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<GenerationJob>, StoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM generation_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, expected = ?expected), err)]
    async fn claim_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE generation_jobs
            SET status = 'processing',
                claimed_at = $2,
                attempt = attempt + 1,
                version = version + 1,
                updated_at = $2
            WHERE job_id = $1
              AND status = 'pending'
              AND ($3::BIGINT IS NULL OR version = $3)
            RETURNING "#,
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(expected_param(expected)?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        match row {
            Some(row) => Ok(ClaimOutcome::Claimed(decode_job(&row)?)),
            None => self.missing_or_conflict(job_id, ClaimOutcome::Conflict).await,
        }
    }

    #[instrument(skip(self, result_ref), fields(job_id = %job_id, expected = ?expected), err)]
    async fn complete_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE generation_jobs
            SET status = 'completed',
                result_ref = $4,
                version = version + 1,
                updated_at = $2
            WHERE job_id = $1
              AND status = 'processing'
              AND ($3::BIGINT IS NULL OR version = $3)
            RETURNING "#,
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(expected_param(expected)?)
        .bind(result_ref)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(decode_job(&row)?)),
            None => self.missing_or_conflict(job_id, TransitionOutcome::Conflict).await,
        }
    }

    #[instrument(
        skip(self, error),
        fields(job_id = %job_id, expected = ?expected, kind = error.kind.as_str()),
        err
    )]
    async fn fail_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        error: &ErrorInfo,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE generation_jobs
            SET status = 'failed',
                error_kind = $4,
                error_message = $5,
                version = version + 1,
                updated_at = $2
            WHERE job_id = $1
              AND status = 'processing'
              AND ($3::BIGINT IS NULL OR version = $3)
            RETURNING "#,
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(expected_param(expected)?)
        .bind(error.kind.as_str())
        .bind(&error.message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        match row {
            Some(row) => Ok(TransitionOutcome::Applied(decode_job(&row)?)),
            None => self.missing_or_conflict(job_id, TransitionOutcome::Conflict).await,
        }
    }

    #[instrument(skip(self), err)]
    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let query = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM generation_jobs
            WHERE status = 'processing' AND claimed_at < $1
            ORDER BY claimed_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit_param(limit));
        self.jobs_where("stale_jobs", query).await
    }

    #[instrument(skip(self), err)]
    async fn refund_due_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>, StoreError> {
        let query = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM generation_jobs
            WHERE status = 'failed' AND refunded = FALSE
            ORDER BY updated_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit_param(limit));
        self.jobs_where("refund_due_jobs", query).await
    }

    #[instrument(skip(self), err)]
    async fn orphaned_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let query = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM generation_jobs
            WHERE status = 'pending' AND COALESCE(requeued_at, created_at) < $1
            ORDER BY COALESCE(requeued_at, created_at) ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit_param(limit));
        self.jobs_where("orphaned_pending", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_requeued(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET requeued_at = $3,
                updated_at = $3
            WHERE job_id = $1
              AND status = 'pending'
              AND COALESCE(requeued_at, created_at) < $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_requeued", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UsageStore for PostgresStore {
    #[instrument(
        skip(self, key),
        fields(user_id = %key.user_id, feature = %key.feature_id, period = %key.period_key),
        err
    )]
    async fn increment_usage(
        &self,
        key: &UsageKey,
        limit: u64,
    ) -> Result<UsageOutcome, StoreError> {
        if limit == 0 {
            let count = self.usage_count(key).await?;
            return Ok(UsageOutcome::LimitExceeded { count });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, feature_id, period_key, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, feature_id, period_key)
            DO UPDATE SET count = usage_counters.count + 1
            WHERE usage_counters.count < $4
            RETURNING count
            "#,
        )
        .bind(key.user_id.as_uuid())
        .bind(&key.feature_id)
        .bind(key.period_key.as_str())
        .bind(to_db(limit, "limit")?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_usage", e))?;

        match row {
            Some(row) => {
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| map_sqlx_error("increment_usage", e))?;
                Ok(UsageOutcome::Accepted {
                    count: from_db(count, "usage count")?,
                })
            }
            None => Ok(UsageOutcome::LimitExceeded {
                count: self.usage_count(key).await?,
            }),
        }
    }

    #[instrument(
        skip(self, key),
        fields(user_id = %key.user_id, feature = %key.feature_id, period = %key.period_key),
        err
    )]
    async fn release_usage(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE usage_counters
            SET count = count - 1
            WHERE user_id = $1 AND feature_id = $2 AND period_key = $3 AND count > 0
            RETURNING count
            "#,
        )
        .bind(key.user_id.as_uuid())
        .bind(&key.feature_id)
        .bind(key.period_key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_usage", e))?;

        match row {
            Some(row) => {
                let count: i64 = row
                    .try_get("count")
                    .map_err(|e| map_sqlx_error("release_usage", e))?;
                from_db(count, "usage count")
            }
            None => Ok(0),
        }
    }

    async fn usage_count(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count FROM usage_counters
            WHERE user_id = $1 AND feature_id = $2 AND period_key = $3
            "#,
        )
        .bind(key.user_id.as_uuid())
        .bind(&key.feature_id)
        .bind(key.period_key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_count", e))?;

        count.map(|c| from_db(c, "usage count")).unwrap_or(Ok(0))
    }
}

#[async_trait]
impl WebhookStore for PostgresStore {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id, user_id = %event.user_id),
        err
    )]
    async fn record_payment(&self, event: &WebhookEvent) -> Result<WebhookOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, user_id, tokens, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.event_id)
        .bind(event.user_id.as_uuid())
        .bind(to_db(event.tokens, "tokens")?)
        .bind(event.processed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_webhook_event", e))?;

        if inserted.is_none() {
            finish(tx, false).await?;
            return Ok(WebhookOutcome::Duplicate);
        }

        let entry = LedgerEntry::new(
            event.user_id,
            EntryKind::Credit,
            event.tokens,
            IdempotencyKey::payment(&event.event_id),
            event.processed_at,
        );
        let balance = match credit_in(&mut tx, &entry).await? {
            Some(balance) => balance,
            None => current_balance(&mut tx, event.user_id).await?,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(WebhookOutcome::Processed { balance })
    }
}

/// Debit inside an open transaction. The caller rolls back unless `Applied`.
async fn debit_in(
    conn: &mut PgConnection,
    user_id: UserId,
    amount: u64,
    key: &IdempotencyKey,
    now: DateTime<Utc>,
) -> Result<DebitOutcome, StoreError> {
    let entry = LedgerEntry::new(user_id, EntryKind::Debit, amount, key.clone(), now);
    if !insert_entry(conn, &entry).await? {
        return Ok(DebitOutcome::AlreadyApplied);
    }

    let balance: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE token_accounts
        SET balance = balance - $2, updated_at = $3
        WHERE user_id = $1 AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(user_id.as_uuid())
    .bind(to_db(amount, "debit amount")?)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("debit_balance", e))?;

    match balance {
        Some(balance) => Ok(DebitOutcome::Applied {
            balance: from_db(balance, "balance")?,
        }),
        None => Ok(DebitOutcome::InsufficientFunds {
            available: current_balance(conn, user_id).await?,
        }),
    }
}

/// Insert an inflow entry and add it to the balance. `None` if the key was
/// already used (nothing written).
async fn credit_in(
    conn: &mut PgConnection,
    entry: &LedgerEntry,
) -> Result<Option<u64>, StoreError> {
    if !insert_entry(conn, entry).await? {
        return Ok(None);
    }

    let balance: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO token_accounts (user_id, balance, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id)
        DO UPDATE SET balance = token_accounts.balance + EXCLUDED.balance,
                      updated_at = EXCLUDED.updated_at
        RETURNING balance
        "#,
    )
    .bind(entry.user_id.as_uuid())
    .bind(to_db(entry.amount, "credit amount")?)
    .bind(entry.created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("credit_balance", e))?;

    Ok(Some(from_db(balance, "balance")?))
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<bool, StoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO ledger_entries (entry_id, user_id, kind, amount, idempotency_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING entry_id
        "#,
    )
    .bind(entry.entry_id.as_uuid())
    .bind(entry.user_id.as_uuid())
    .bind(entry.kind.as_str())
    .bind(to_db(entry.amount, "amount")?)
    .bind(entry.idempotency_key.as_str())
    .bind(entry.created_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_entry", e))?;

    Ok(inserted.is_some())
}

async fn current_balance(conn: &mut PgConnection, user_id: UserId) -> Result<u64, StoreError> {
    let balance: Option<i64> =
        sqlx::query_scalar("SELECT balance FROM token_accounts WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("current_balance", e))?;
    balance.map(|b| from_db(b, "balance")).unwrap_or(Ok(0))
}

async fn finish(
    tx: sqlx::Transaction<'_, sqlx::Postgres>,
    commit: bool,
) -> Result<(), StoreError> {
    if commit {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    } else {
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn to_db(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Conflict(format!("{what} {value} is out of range")))
}

fn from_db(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn expected_param(expected: ExpectedVersion) -> Result<Option<i64>, StoreError> {
    expected.exact().map(|v| to_db(v, "version")).transpose()
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique or check constraint violation
                Some("23505") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    user_id: Uuid,
    balance: i64,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            user_id: row.try_get("user_id")?,
            balance: row.try_get("balance")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AccountRow> for TokenAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(TokenAccount {
            user_id: UserId::from_uuid(row.user_id),
            balance: from_db(row.balance, "balance")?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct EntryRow {
    entry_id: Uuid,
    user_id: Uuid,
    kind: String,
    amount: i64,
    idempotency_key: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            entry_id: row.try_get("entry_id")?,
            user_id: row.try_get("user_id")?,
            kind: row.try_get("kind")?,
            amount: row.try_get("amount")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let kind = EntryKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown entry kind: {}", row.kind)))?;
        Ok(LedgerEntry {
            entry_id: EntryId::from_uuid(row.entry_id),
            user_id: UserId::from_uuid(row.user_id),
            kind,
            amount: from_db(row.amount, "amount")?,
            idempotency_key: IdempotencyKey::from_raw(row.idempotency_key),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    job_id: Uuid,
    user_id: Uuid,
    status: String,
    cost: i64,
    request: serde_json::Value,
    result_ref: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    attempt: i32,
    refunded: bool,
    version: i64,
    requeued_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            cost: row.try_get("cost")?,
            request: row.try_get("request")?,
            result_ref: row.try_get("result_ref")?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            claimed_at: row.try_get("claimed_at")?,
            attempt: row.try_get("attempt")?,
            refunded: row.try_get("refunded")?,
            version: row.try_get("version")?,
            requeued_at: row.try_get("requeued_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status: {}", row.status)))?;
        let request: GenerationRequest = serde_json::from_value(row.request)
            .map_err(|e| StoreError::Corrupt(format!("failed to decode request: {e}")))?;
        let error_info = match (row.error_kind, row.error_message) {
            (Some(kind), message) => Some(ErrorInfo {
                kind: FailureKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown failure kind: {kind}")))?,
                message: message.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        Ok(GenerationJob {
            job_id: JobId::from_uuid(row.job_id),
            user_id: UserId::from_uuid(row.user_id),
            status,
            cost: from_db(row.cost, "cost")?,
            request,
            result_ref: row.result_ref,
            error_info,
            claimed_at: row.claimed_at,
            attempt: u32::try_from(row.attempt)
                .map_err(|_| StoreError::Corrupt(format!("negative attempt: {}", row.attempt)))?,
            refunded: row.refunded,
            version: from_db(row.version, "version")?,
            requeued_at: row.requeued_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<GenerationJob, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}
