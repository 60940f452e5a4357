//! Failure resolution shared by workers and the reaper.
//!
//! Both paths move a job Processing -> Failed under the same version guard and
//! then refund it. Whichever arrives second sees a conflict and does nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tokenmill_core::{ErrorInfo, ExpectedVersion, GenerationJob};

use super::retry::RetryPolicy;
use crate::ledger::TokenLedger;
use crate::store::{RefundOutcome, Store, StoreError, TransitionOutcome};

/// What happened when resolving a job as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResolution {
    /// Failed and refunded.
    Refunded,
    /// Failed, but the refund write did not land; a later sweep retries it.
    RefundPending,
    /// The job was already resolved by someone else.
    Superseded,
}

#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn Store>,
    ledger: TokenLedger,
    refund_policy: RetryPolicy,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn Store>, refund_policy: RetryPolicy) -> Self {
        Self {
            ledger: TokenLedger::new(store.clone()),
            store,
            refund_policy,
        }
    }

    /// Processing -> Failed at `job.version`, then refund.
    pub async fn fail_and_refund(
        &self,
        job: &GenerationJob,
        error: ErrorInfo,
        now: DateTime<Utc>,
    ) -> Result<FailureResolution, StoreError> {
        let outcome = self
            .store
            .fail_job(job.job_id, ExpectedVersion::Exact(job.version), &error, now)
            .await?;

        match outcome {
            TransitionOutcome::Applied(failed) => {
                info!(
                    job_id = %failed.job_id,
                    user_id = %failed.user_id,
                    kind = failed.error_info.as_ref().map(|e| e.kind.as_str()).unwrap_or("unknown"),
                    "job failed"
                );
                Ok(self.settle_refund(&failed).await)
            }
            TransitionOutcome::Conflict => Ok(FailureResolution::Superseded),
        }
    }

    /// Refund a failed job, retrying transient store errors.
    pub async fn settle_refund(&self, job: &GenerationJob) -> FailureResolution {
        let result = self
            .refund_policy
            .run(|_| self.ledger.refund(job.job_id, job.user_id, job.cost))
            .await;

        match result {
            Ok(RefundOutcome::Refunded { balance }) => {
                info!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    amount = job.cost,
                    balance,
                    "job refunded"
                );
                FailureResolution::Refunded
            }
            Ok(RefundOutcome::AlreadyRefunded) => FailureResolution::Refunded,
            Ok(RefundOutcome::NotRefundable { status }) => {
                warn!(
                    job_id = %job.job_id,
                    status = %status,
                    "refund requested for a job that is not failed"
                );
                FailureResolution::Superseded
            }
            Err(err) => {
                warn!(
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    error = %err,
                    "refund failed; left for the reaper"
                );
                FailureResolution::RefundPending
            }
        }
    }
}
