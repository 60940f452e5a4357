//! Job queue boundary.
//!
//! The queue only carries job ids. The store stays authoritative: a worker
//! re-reads the job and claims it conditionally, so duplicate deliveries and
//! redeliveries are harmless.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use tokenmill_core::JobId;

pub use memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

/// One delivered job id plus whatever the backend needs to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Backend message id (stream entry id for Redis, empty in memory).
    pub receipt: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("malformed queue message: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a delivery. `None` on timeout.
    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery handled so it is not redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}
