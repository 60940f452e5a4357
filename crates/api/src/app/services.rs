//! Service wiring: picks the store and queue backends and builds the
//! services the handlers, workers and reaper share.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use tokenmill_core::FeatureCatalog;
use tokenmill_infra::jobs::{
    GenerationClient, JobDispatcher, JobLifecycle, JobService, RetryPolicy, WorkerPool,
};
use tokenmill_infra::queue::{InMemoryJobQueue, JobQueue, QueueError};
use tokenmill_infra::store::{InMemoryStore, PostgresStore, Store, StoreError};
use tokenmill_infra::{
    AppConfig, ConfigError, HmacSha256Verifier, PaymentWebhookGuard, ReaperConfig, StaleJobReaper,
    TokenLedger,
};

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: TokenLedger,
    pub jobs: JobService,
    pub webhooks: PaymentWebhookGuard,
    lifecycle: JobLifecycle,
    dispatcher: JobDispatcher,
}

impl AppServices {
    pub fn from_parts(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        catalog: FeatureCatalog,
        config: &AppConfig,
    ) -> Self {
        let dispatcher = JobDispatcher::new(queue.clone());
        let lifecycle = JobLifecycle::new(store.clone(), RetryPolicy::default());
        let jobs = JobService::new(
            store.clone(),
            Arc::new(catalog),
            dispatcher.clone(),
            config.submit_config(),
        );
        let webhooks = PaymentWebhookGuard::new(
            store.clone(),
            Arc::new(HmacSha256Verifier::new(&config.webhook_secret)),
        );

        Self {
            ledger: TokenLedger::new(store.clone()),
            store,
            queue,
            jobs,
            webhooks,
            lifecycle,
            dispatcher,
        }
    }

    /// In-memory store and queue (dev/test).
    pub fn in_memory(config: &AppConfig) -> Result<Self, ServicesError> {
        Ok(Self::from_parts(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryJobQueue::new()),
            config.load_catalog()?,
            config,
        ))
    }

    /// Backends chosen by configuration: Postgres when `DATABASE_URL` is set,
    /// Redis Streams when `REDIS_URL` is set and the `redis` feature is on.
    pub async fn from_config(config: &AppConfig) -> Result<Self, ServicesError> {
        let catalog = config.load_catalog()?;

        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                let store = PostgresStore::connect(url, config.database_max_connections).await?;
                store.migrate().await?;
                info!("using postgres store");
                Arc::new(store)
            }
            None => {
                info!("DATABASE_URL not set; using in-memory store");
                Arc::new(InMemoryStore::new())
            }
        };

        let queue = build_queue(config).await?;
        Ok(Self::from_parts(store, queue, catalog, config))
    }

    pub fn worker_pool(&self, generator: Arc<dyn GenerationClient>) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            self.queue.clone(),
            generator,
            self.lifecycle.clone(),
        )
    }

    pub fn reaper(&self, config: ReaperConfig) -> StaleJobReaper {
        StaleJobReaper::new(
            self.store.clone(),
            self.lifecycle.clone(),
            self.dispatcher.clone(),
            config,
        )
    }
}

#[cfg(feature = "redis")]
async fn build_queue(config: &AppConfig) -> Result<Arc<dyn JobQueue>, ServicesError> {
    use tokenmill_infra::queue::RedisStreamsJobQueue;

    match &config.redis_url {
        Some(url) => {
            let consumer = format!("tokenmill-{}", std::process::id());
            let queue = RedisStreamsJobQueue::connect(url, consumer).await?;
            info!("using redis streams queue");
            Ok(Arc::new(queue))
        }
        None => Ok(Arc::new(InMemoryJobQueue::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_queue(config: &AppConfig) -> Result<Arc<dyn JobQueue>, ServicesError> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but the redis feature is not enabled; using in-memory queue");
    }
    Ok(Arc::new(InMemoryJobQueue::new()))
}
