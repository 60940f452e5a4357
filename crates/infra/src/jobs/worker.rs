//! Worker pool.
//!
//! Each worker pops a job id, re-reads the job, claims it under its version and
//! calls the generation collaborator in a task of its own, so a panic fails
//! the job instead of killing the loop. Pop timeouts double as housekeeping
//! ticks.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tokenmill_core::{ErrorInfo, ExpectedVersion, JobStatus};

use super::generation::GenerationClient;
use super::lifecycle::{FailureResolution, JobLifecycle};
use crate::queue::{Delivery, JobQueue};
use crate::store::{ClaimOutcome, Store, StoreError, TransitionOutcome};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Longest a worker blocks on the queue before a housekeeping tick.
    pub pop_timeout: Duration,
    /// Prefix for worker names in logs.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pop_timeout: Duration::from_secs(2),
            name: "worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Deliveries dropped without effect: claim lost, job already resolved,
    /// or a late result after the reaper failed the job.
    pub jobs_discarded: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What one delivery amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(FailureResolution),
    Discarded,
}

pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Stop popping new work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    generator: Arc<dyn GenerationClient>,
    lifecycle: JobLifecycle,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        generator: Arc<dyn GenerationClient>,
        lifecycle: JobLifecycle,
    ) -> Self {
        Self {
            store,
            queue,
            generator,
            lifecycle,
        }
    }

    pub fn spawn(self, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let started = Instant::now();

        let joins = (0..config.workers.max(1))
            .map(|idx| {
                let pool = self.clone();
                let name = format!("{}-{idx}", config.name);
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                let pop_timeout = config.pop_timeout;
                tokio::spawn(async move {
                    pool.worker_loop(name, pop_timeout, shutdown, stats, started).await;
                })
            })
            .collect();

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }

    async fn worker_loop(
        &self,
        name: String,
        pop_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<Mutex<PoolStats>>,
        started: Instant,
    ) {
        info!(worker = %name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            update(&stats, |s| s.uptime_secs = started.elapsed().as_secs());

            let popped = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                popped = self.queue.pop(pop_timeout) => popped,
            };

            let delivery = match popped {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    error!(worker = %name, error = %err, "queue pop failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(pop_timeout) => continue,
                    }
                }
            };

            update(&stats, |s| s.current_running += 1);
            let result = self.process(&name, &delivery).await;
            update(&stats, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.jobs_processed += 1;
                match &result {
                    Ok(JobOutcome::Completed) => s.jobs_succeeded += 1,
                    Ok(JobOutcome::Failed(_)) => s.jobs_failed += 1,
                    Ok(JobOutcome::Discarded) => s.jobs_discarded += 1,
                    Err(_) => {}
                }
            });

            if let Err(err) = result {
                // Left unacked; redelivery or the reaper picks it up.
                error!(
                    worker = %name,
                    job_id = %delivery.job_id,
                    error = %err,
                    "job processing failed"
                );
            }
        }

        info!(worker = %name, "worker stopped");
    }

    /// Handle one delivery end to end. The delivery is acked once the job's
    /// outcome is settled.
    pub async fn process(
        &self,
        worker: &str,
        delivery: &Delivery,
    ) -> Result<JobOutcome, StoreError> {
        let outcome = self.run_job(worker, delivery).await?;
        if let Err(err) = self.queue.ack(delivery).await {
            warn!(worker = %worker, job_id = %delivery.job_id, error = %err, "ack failed");
        }
        Ok(outcome)
    }

    async fn run_job(&self, worker: &str, delivery: &Delivery) -> Result<JobOutcome, StoreError> {
        let Some(job) = self.store.get_job(delivery.job_id).await? else {
            warn!(worker = %worker, job_id = %delivery.job_id, "delivered job does not exist");
            return Ok(JobOutcome::Discarded);
        };

        if job.status != JobStatus::Pending {
            debug!(
                worker = %worker,
                job_id = %job.job_id,
                status = %job.status,
                "job no longer pending"
            );
            return Ok(JobOutcome::Discarded);
        }

        let claimed = match self
            .store
            .claim_job(job.job_id, ExpectedVersion::Exact(job.version), Utc::now())
            .await?
        {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::Conflict => {
                debug!(worker = %worker, job_id = %job.job_id, "claim conflict");
                return Ok(JobOutcome::Discarded);
            }
        };

        debug!(
            worker = %worker,
            job_id = %claimed.job_id,
            user_id = %claimed.user_id,
            feature = %claimed.feature(),
            attempt = claimed.attempt,
            "claimed job"
        );

        let generator = self.generator.clone();
        let job_id = claimed.job_id;
        let request = claimed.request.clone();
        let generated =
            tokio::spawn(async move { generator.generate(job_id, &request).await }).await;

        let error = match generated {
            Ok(Ok(result_ref)) => {
                let expected = ExpectedVersion::Exact(claimed.version);
                return match self
                    .store
                    .complete_job(job_id, expected, &result_ref, Utc::now())
                    .await?
                {
                    TransitionOutcome::Applied(done) => {
                        info!(
                            worker = %worker,
                            job_id = %done.job_id,
                            user_id = %done.user_id,
                            "job completed"
                        );
                        Ok(JobOutcome::Completed)
                    }
                    TransitionOutcome::Conflict => {
                        info!(worker = %worker, job_id = %job_id, "discarded late result");
                        Ok(JobOutcome::Discarded)
                    }
                };
            }
            Ok(Err(err)) => ErrorInfo::collaborator(err.to_string()),
            Err(join_err) if join_err.is_panic() => {
                ErrorInfo::crashed(panic_message(join_err.into_panic()))
            }
            Err(join_err) => ErrorInfo::crashed(join_err.to_string()),
        };

        match self.lifecycle.fail_and_refund(&claimed, error, Utc::now()).await? {
            FailureResolution::Superseded => {
                info!(worker = %worker, job_id = %job_id, "discarded late failure");
                Ok(JobOutcome::Discarded)
            }
            resolution => Ok(JobOutcome::Failed(resolution)),
        }
    }
}

fn update(stats: &Mutex<PoolStats>, f: impl FnOnce(&mut PoolStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("generation panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("generation panicked: {s}")
    } else {
        "generation panicked".to_string()
    }
}
