//! In-process FIFO queue for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tokenmill_core::JobId;

use super::{Delivery, JobQueue, QueueError};

/// In-memory queue. Deliveries are at-most-once; `ack` is a no-op.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Result<Option<JobId>, QueueError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| QueueError::Connection("in-memory queue lock poisoned".to_string()))?;
        Ok(items.pop_front())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job_id: JobId) -> Result<(), QueueError> {
        self.items
            .lock()
            .map_err(|_| QueueError::Connection("in-memory queue lock poisoned".to_string()))?
            .push_back(job_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.notify.notified();
            if let Some(job_id) = self.try_pop()? {
                return Ok(Some(Delivery {
                    job_id,
                    receipt: String::new(),
                }));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = InMemoryJobQueue::new();
        let (a, b) = (JobId::new(), JobId::new());
        queue.push(a).await.unwrap();
        queue.push(b).await.unwrap();

        let first = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!((first.job_id, second.job_id), (a, b));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        assert_eq!(queue.pop(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = JobId::new();
        queue.push(job).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job_id, job);
    }
}
