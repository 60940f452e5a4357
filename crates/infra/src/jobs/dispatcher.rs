//! Hands persisted jobs to the queue.

use std::sync::Arc;

use tracing::debug;

use tokenmill_core::GenerationJob;

use super::retry::RetryPolicy;
use crate::queue::{JobQueue, QueueError};

#[derive(Clone)]
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue `job`, retrying push failures per `policy`.
    pub async fn dispatch(
        &self,
        job: &GenerationJob,
        policy: &RetryPolicy,
    ) -> Result<(), QueueError> {
        let job_id = job.job_id;
        policy
            .run(|attempt| {
                if attempt > 0 {
                    debug!(job_id = %job_id, attempt, "retrying enqueue");
                }
                self.queue.push(job_id)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokenmill_core::{GenerationRequest, JobId, UserId};

    use crate::queue::Delivery;

    /// Fails the first `failures` pushes.
    struct FlakyQueue {
        failures: u32,
        pushes: AtomicU32,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn push(&self, _job_id: JobId) -> Result<(), QueueError> {
            let n = self.pushes.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(QueueError::Connection("down".into()))
            } else {
                Ok(())
            }
        }

        async fn pop(&self, _timeout: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn job() -> GenerationJob {
        let request = GenerationRequest::new("image", "fox");
        GenerationJob::pending(UserId::new(), request, 10, Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_retries_transient_push_failures() {
        let queue = Arc::new(FlakyQueue { failures: 2, pushes: AtomicU32::new(0) });
        let dispatcher = JobDispatcher::new(queue.clone());

        dispatcher
            .dispatch(&job(), &RetryPolicy::fixed(3, Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(queue.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_gives_up_after_policy() {
        let queue = Arc::new(FlakyQueue { failures: 10, pushes: AtomicU32::new(0) });
        let dispatcher = JobDispatcher::new(queue.clone());

        let result = dispatcher.dispatch(&job(), &RetryPolicy::no_retry()).await;
        assert!(result.is_err());
        assert_eq!(queue.pushes.load(Ordering::SeqCst), 1);
    }
}
