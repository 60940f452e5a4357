//! Job submission and lookup.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use tokenmill_core::{
    DomainError, FeatureCatalog, GenerationJob, GenerationRequest, JobId, JobStatus,
    SubscriptionTier, UserId,
};

use super::dispatcher::JobDispatcher;
use super::retry::RetryPolicy;
use crate::store::{CreateJobOutcome, Store, StoreError};
use crate::usage::UsageLimiter;

/// Why a submission was turned away. Nothing was charged or created.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("insufficient tokens: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("usage limit of {limit} reached for {feature}")]
    LimitExceeded { feature: String, limit: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for SubmitError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => SubmitError::Validation(msg),
            other => SubmitError::Validation(other.to_string()),
        }
    }
}

/// Accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub cost: u64,
    pub status: JobStatus,
    pub balance: u64,
}

#[derive(Debug, Clone)]
pub struct SubmitConfig {
    pub max_prompt_chars: usize,
    pub dispatch_policy: RetryPolicy,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 4000,
            dispatch_policy: RetryPolicy::default(),
        }
    }
}

/// Front door of the job pipeline: limiter, then debit + job, then enqueue.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn Store>,
    catalog: Arc<FeatureCatalog>,
    limiter: UsageLimiter,
    dispatcher: JobDispatcher,
    config: SubmitConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<FeatureCatalog>,
        dispatcher: JobDispatcher,
        config: SubmitConfig,
    ) -> Self {
        Self {
            limiter: UsageLimiter::new(store.clone(), catalog.clone()),
            store,
            catalog,
            dispatcher,
            config,
        }
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    pub fn limiter(&self) -> &UsageLimiter {
        &self.limiter
    }

    pub async fn submit(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        request: GenerationRequest,
    ) -> Result<SubmittedJob, SubmitError> {
        request.validate(self.config.max_prompt_chars)?;
        let feature = self.catalog.require(&request.feature)?.clone();
        let now = Utc::now();

        let Some(reservation) = self.limiter.reserve(user_id, tier, &feature, now).await? else {
            info!(user_id = %user_id, feature = %feature.id, "usage limit reached");
            return Err(SubmitError::LimitExceeded {
                limit: feature.limits.for_tier(tier),
                feature: feature.id,
            });
        };

        let job = GenerationJob::pending(user_id, request, feature.cost, now);
        let balance = match self.store.create_job_with_debit(&job, now).await {
            Ok(CreateJobOutcome::Created { balance }) => balance,
            Ok(CreateJobOutcome::InsufficientFunds { available }) => {
                self.limiter.release(&reservation).await;
                info!(
                    user_id = %user_id,
                    available,
                    required = feature.cost,
                    "insufficient tokens"
                );
                return Err(SubmitError::InsufficientFunds {
                    available,
                    required: feature.cost,
                });
            }
            Err(err) => {
                self.limiter.release(&reservation).await;
                return Err(err.into());
            }
        };

        info!(
            job_id = %job.job_id,
            user_id = %user_id,
            feature = %feature.id,
            cost = feature.cost,
            "job accepted"
        );

        // The job is persisted and paid for; a lost enqueue is recovered by the reaper.
        if let Err(err) = self.dispatcher.dispatch(&job, &self.config.dispatch_policy).await {
            warn!(job_id = %job.job_id, error = %err, "enqueue failed; job left for requeue");
        }

        Ok(SubmittedJob {
            job_id: job.job_id,
            cost: job.cost,
            status: job.status,
            balance,
        })
    }

    /// A job visible to `user_id`. Other users' jobs look absent.
    pub async fn get(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .filter(|job| job.user_id == user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TokenLedger;
    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::store::{InMemoryStore, LedgerStore, UsageStore};
    use std::time::Duration;
    use tokenmill_core::{Period, UsageKey};

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryJobQueue>,
        service: JobService,
        ledger: TokenLedger,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let service = JobService::new(
            store.clone(),
            Arc::new(FeatureCatalog::default()),
            JobDispatcher::new(queue.clone()),
            SubmitConfig::default(),
        );
        Fixture {
            ledger: TokenLedger::new(store.clone()),
            store,
            queue,
            service,
        }
    }

    fn image(prompt: &str) -> GenerationRequest {
        GenerationRequest::new("image", prompt)
    }

    #[tokio::test]
    async fn insufficient_balance_creates_nothing() {
        let f = fixture();
        let user = UserId::new();
        f.ledger.grant(user, 5, "seed").await.unwrap();

        let err = f
            .service
            .submit(user, SubscriptionTier::Free, image("fox"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::InsufficientFunds { available: 5, required: 10 }));
        assert_eq!(f.ledger.balance(user).await.unwrap(), 5);
        assert!(f.queue.is_empty());
        assert_eq!(f.store.entries(user, 10).await.unwrap().len(), 1);

        let key = UsageKey::new(user, "image", Period::Daily.key_for(Utc::now()));
        assert_eq!(f.store.usage_count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn accepted_job_is_debited_and_enqueued() {
        let f = fixture();
        let user = UserId::new();
        f.ledger.grant(user, 10, "seed").await.unwrap();

        let submitted = f
            .service
            .submit(user, SubscriptionTier::Free, image("fox"))
            .await
            .unwrap();

        assert_eq!(submitted.cost, 10);
        assert_eq!(submitted.balance, 0);
        assert_eq!(submitted.status, JobStatus::Pending);
        let delivery = f.queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, submitted.job_id);
    }

    #[tokio::test]
    async fn sixth_free_image_of_the_day_is_limited() {
        let f = fixture();
        let user = UserId::new();
        f.ledger.grant(user, 1000, "seed").await.unwrap();

        for _ in 0..5 {
            f.service
                .submit(user, SubscriptionTier::Free, image("fox"))
                .await
                .unwrap();
        }
        let err = f
            .service
            .submit(user, SubscriptionTier::Free, image("fox"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::LimitExceeded { limit: 5, .. }));
        assert_eq!(f.ledger.balance(user).await.unwrap(), 950);
        let snap = f
            .service
            .limiter()
            .snapshot(user, SubscriptionTier::Free, "image", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.count, 5);
    }

    #[tokio::test]
    async fn validation_errors_have_no_side_effects() {
        let f = fixture();
        let user = UserId::new();
        f.ledger.grant(user, 100, "seed").await.unwrap();

        for request in [
            GenerationRequest::new("audio", "fox"),
            GenerationRequest::new("image", "  "),
            image(&"x".repeat(5000)),
        ] {
            let err = f
                .service
                .submit(user, SubscriptionTier::Free, request)
                .await
                .unwrap_err();
            assert!(matches!(err, SubmitError::Validation(_)));
        }
        assert_eq!(f.ledger.balance(user).await.unwrap(), 100);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn other_users_cannot_see_a_job() {
        let f = fixture();
        let owner = UserId::new();
        f.ledger.grant(owner, 10, "seed").await.unwrap();
        let submitted = f
            .service
            .submit(owner, SubscriptionTier::Pro, image("fox"))
            .await
            .unwrap();

        assert!(f.service.get(owner, submitted.job_id).await.unwrap().is_some());
        assert!(f.service.get(UserId::new(), submitted.job_id).await.unwrap().is_none());
    }
}
