//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream Key**: `tokenmill:jobs`, one entry per dispatched job id
//! - **Consumer Group**: `tokenmill-workers`, shared by every worker
//! - **Consumers**: one name per process; entries are load-balanced
//! - **Redelivery**: entries left unacknowledged longer than the pending
//!   timeout (a worker died mid-job) are claimed by the next `pop`

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use tracing::{debug, instrument, warn};

use tokenmill_core::JobId;

use super::{Delivery, JobQueue, QueueError};

/// Default stream key for dispatched jobs
const DEFAULT_STREAM_KEY: &str = "tokenmill:jobs";

/// Default consumer group
const DEFAULT_GROUP: &str = "tokenmill-workers";

/// Entries idle longer than this are redelivered
const PENDING_TIMEOUT_MS: usize = 60_000;

/// Reader connections kept for reuse between pops.
const MAX_IDLE_READERS: usize = 16;

#[derive(Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    /// Shared by non-blocking commands (XADD, XACK, XPENDING, XCLAIM).
    commands: MultiplexedConnection,
    /// Idle connections for `XREADGROUP BLOCK`, which would stall a shared
    /// connection for the whole block.
    readers: Arc<Mutex<Vec<MultiplexedConnection>>>,
    stream_key: String,
    group: String,
    consumer: String,
}

impl std::fmt::Debug for RedisStreamsJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsJobQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsJobQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `consumer` - this process's consumer name within the group
    pub async fn connect(redis_url: &str, consumer: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let commands = open(&client).await?;

        let queue = Self {
            client: Arc::new(client),
            commands,
            readers: Arc::new(Mutex::new(Vec::new())),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    async fn checkout_reader(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => open(&self.client).await,
        }
    }

    fn checkin_reader(&self, conn: MultiplexedConnection) {
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group is fine.
    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Claim one entry another consumer left idle past the pending timeout.
    async fn claim_idle(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<Delivery>, QueueError> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", 10)
            .await
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        let idle: Vec<&str> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= PENDING_TIMEOUT_MS)
            .map(|p| p.id.as_str())
            .collect();
        if idle.is_empty() {
            return Ok(None);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.stream_key,
                &self.group,
                &self.consumer,
                PENDING_TIMEOUT_MS,
                &idle[..],
            )
            .await
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

        match claimed.ids.into_iter().next() {
            Some(entry) => {
                debug!(
                    stream_key = %self.stream_key,
                    message_id = %entry.id,
                    "reclaimed idle entry"
                );
                self.to_delivery(conn, entry).await
            }
            None => Ok(None),
        }
    }

    /// Parse an entry. Malformed entries are acknowledged and dropped.
    async fn to_delivery(
        &self,
        conn: &mut MultiplexedConnection,
        entry: StreamId,
    ) -> Result<Option<Delivery>, QueueError> {
        let raw: Option<String> = entry.get("job_id");
        match raw.as_deref().map(str::parse::<JobId>) {
            Some(Ok(job_id)) => Ok(Some(Delivery {
                job_id,
                receipt: entry.id,
            })),
            _ => {
                warn!(message_id = %entry.id, "dropping malformed queue entry");
                let _: usize = conn
                    .xack(&self.stream_key, &self.group, &[&entry.id])
                    .await
                    .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
                Ok(None)
            }
        }
    }
}

async fn open(client: &redis::Client) -> Result<MultiplexedConnection, QueueError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip(self), fields(stream_key = %self.stream_key, job_id = %job_id), err)]
    async fn push(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let _: String = conn
            .xadd(&self.stream_key, "*", &[("job_id", job_id.to_string())])
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.commands.clone();
        if let Some(delivery) = self.claim_idle(&mut conn).await? {
            return Ok(Some(delivery));
        }

        let block_ms = usize::try_from(timeout.as_millis()).unwrap_or(usize::MAX).max(1);
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(block_ms);

        // A BLOCK timeout comes back as nil. A reader that errored is dropped.
        let mut reader = self.checkout_reader().await?;
        let reply: Option<StreamReadReply> = reader
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;
        self.checkin_reader(reader);

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        match entry {
            Some(entry) => self.to_delivery(&mut conn, entry).await,
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.job_id, message_id = %delivery.receipt),
        err
    )]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if delivery.receipt.is_empty() {
            return Ok(());
        }
        let mut conn = self.commands.clone();
        let _: usize = conn
            .xack(&self.stream_key, &self.group, &[&delivery.receipt])
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Needs a live server; skipped when `REDIS_URL` is unset.
    #[tokio::test]
    async fn pops_reuse_one_reader_connection() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let consumer = format!("test-{}", JobId::new());
        let queue = RedisStreamsJobQueue::connect(&url, consumer).await.unwrap();

        let job_id = JobId::new();
        queue.push(job_id).await.unwrap();
        let delivery = loop {
            if let Some(d) = queue.pop(Duration::from_millis(200)).await.unwrap() {
                if d.job_id == job_id {
                    break d;
                }
                queue.ack(&d).await.unwrap();
            }
        };
        queue.ack(&delivery).await.unwrap();

        for _ in 0..3 {
            let _ = queue.pop(Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(queue.readers.lock().unwrap().len(), 1);
    }
}
