//! Stale job reaper.
//!
//! Runs on a fixed interval. Each sweep:
//! 1. fails and refunds Processing jobs claimed longer ago than the threshold
//! 2. retries refunds that did not land when a job was failed
//! 3. re-enqueues Pending jobs that look like their enqueue was lost

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tokenmill_core::ErrorInfo;

use crate::jobs::{FailureResolution, JobDispatcher, JobLifecycle, RetryPolicy};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Processing longer than this is considered stuck.
    pub stale_after: chrono::Duration,
    /// Pending longer than this is re-enqueued.
    pub requeue_after: chrono::Duration,
    /// Max jobs handled per category per sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(15),
            requeue_after: chrono::Duration::minutes(5),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reaped: usize,
    pub refunds_retried: usize,
    pub requeued: usize,
    /// Store or queue errors hit during the sweep.
    pub errors: usize,
}

/// `now - age`, clamped to the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "reaper task ended abnormally");
        }
    }
}

pub struct StaleJobReaper {
    store: Arc<dyn Store>,
    lifecycle: JobLifecycle,
    dispatcher: JobDispatcher,
    config: ReaperConfig,
}

impl StaleJobReaper {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: JobLifecycle,
        dispatcher: JobDispatcher,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            dispatcher,
            config,
        }
    }

    /// One pass over stale, refund-due and orphaned jobs.
    ///
    /// A failure in one pass is logged and counted; the other passes still run.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.reap_stale(now, &mut report).await;
        self.retry_refunds(&mut report).await;
        self.requeue_orphans(now, &mut report).await;
        report
    }

    async fn reap_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = cutoff(now, self.config.stale_after);
        let stale = match self.store.stale_jobs(cutoff, self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "listing stale jobs failed");
                report.errors += 1;
                return;
            }
        };

        for job in stale {
            let error = ErrorInfo::stale(self.config.stale_after);
            match self.lifecycle.fail_and_refund(&job, error, now).await {
                Ok(FailureResolution::Superseded) => {
                    debug!(job_id = %job.job_id, "stale job resolved concurrently");
                }
                Ok(resolution) => {
                    warn!(
                        job_id = %job.job_id,
                        user_id = %job.user_id,
                        claimed_at = ?job.claimed_at,
                        refunded = resolution == FailureResolution::Refunded,
                        "reaped stale job"
                    );
                    report.reaped += 1;
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "failing stale job failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn retry_refunds(&self, report: &mut SweepReport) {
        let due = match self.store.refund_due_jobs(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "listing refund-due jobs failed");
                report.errors += 1;
                return;
            }
        };

        for job in due {
            if self.lifecycle.settle_refund(&job).await == FailureResolution::Refunded {
                report.refunds_retried += 1;
            }
        }
    }

    /// The stamp is written before the push, so concurrent sweeps and later
    /// ticks do not pile duplicates onto the queue.
    async fn requeue_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = cutoff(now, self.config.requeue_after);
        let orphans = match self.store.orphaned_pending(cutoff, self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "listing orphaned jobs failed");
                report.errors += 1;
                return;
            }
        };

        for job in orphans {
            match self.store.mark_requeued(job.job_id, cutoff, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "stamping re-enqueue failed");
                    report.errors += 1;
                    continue;
                }
            }
            match self.dispatcher.dispatch(&job, &RetryPolicy::no_retry()).await {
                Ok(()) => {
                    info!(job_id = %job.job_id, user_id = %job.user_id, "re-enqueued pending job");
                    report.requeued += 1;
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "re-enqueue failed");
                    report.errors += 1;
                }
            }
        }
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(interval_secs = self.config.interval.as_secs(), "reaper started");
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let report = self.sweep(Utc::now()).await;
                if report != SweepReport::default() {
                    info!(
                        reaped = report.reaped,
                        refunds_retried = report.refunds_retried,
                        requeued = report.requeued,
                        errors = report.errors,
                        "sweep finished"
                    );
                }
            }
            info!("reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobOutcome, WorkerPool};
    use crate::queue::{Delivery, InMemoryJobQueue, JobQueue};
    use crate::store::{
        ClaimOutcome, InMemoryStore, JobStore, LedgerStore, TransitionOutcome,
    };
    use crate::testing::{FlakyStore, ScriptedGenerator, Step, pending_job};
    use chrono::TimeZone;
    use tokenmill_core::{ExpectedVersion, FailureKind, GenerationJob, JobStatus, replay_balance};

    fn reaper(store: Arc<InMemoryStore>, queue: Arc<InMemoryJobQueue>) -> StaleJobReaper {
        StaleJobReaper::new(
            store.clone(),
            JobLifecycle::new(store, RetryPolicy::no_retry()),
            JobDispatcher::new(queue),
            ReaperConfig::default(),
        )
    }

    async fn claim_at(
        store: &InMemoryStore,
        job: &GenerationJob,
        at: DateTime<Utc>,
    ) -> GenerationJob {
        match store
            .claim_job(job.job_id, ExpectedVersion::Exact(job.version), at)
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::Conflict => panic!("claim conflict"),
        }
    }

    #[tokio::test]
    async fn stale_job_is_failed_and_refunded_once() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = reaper(store.clone(), queue);
        let t = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

        let job = pending_job(store.as_ref(), 10, 10).await;
        claim_at(&store, &job, t).await;

        let early = reaper.sweep(t + chrono::Duration::minutes(10)).await;
        assert_eq!(early.reaped, 0);

        let first = reaper.sweep(t + chrono::Duration::minutes(20)).await;
        assert_eq!(first.reaped, 1);
        let stored = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_info.unwrap().kind, FailureKind::Stale);
        assert!(stored.refunded);
        assert_eq!(store.account(job.user_id).await.unwrap().unwrap().balance, 10);

        let second = reaper.sweep(t + chrono::Duration::minutes(35)).await;
        assert_eq!(second, SweepReport::default());
        assert_eq!(store.account(job.user_id).await.unwrap().unwrap().balance, 10);
    }

    #[tokio::test]
    async fn late_worker_result_is_discarded_after_reaping() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = reaper(store.clone(), queue);
        let t = Utc::now() - chrono::Duration::minutes(30);

        let job = pending_job(store.as_ref(), 10, 10).await;
        let claimed = claim_at(&store, &job, t).await;
        reaper.sweep(Utc::now()).await;

        let late = store
            .complete_job(
                claimed.job_id,
                ExpectedVersion::Exact(claimed.version),
                "s3://late",
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(late, TransitionOutcome::Conflict);
        let stored = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.result_ref, None);
    }

    #[tokio::test]
    async fn orphaned_pending_job_is_requeued() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = reaper(store.clone(), queue.clone());

        let job = pending_job(store.as_ref(), 10, 10).await;

        let report = reaper.sweep(Utc::now() + chrono::Duration::minutes(6)).await;
        assert_eq!(report.requeued, 1);
        let delivery = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, job.job_id);

        let fresh = reaper.sweep(Utc::now()).await;
        assert_eq!(fresh.requeued, 0);
    }

    #[tokio::test]
    async fn backlogged_pending_job_is_requeued_once_per_window() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = reaper(store.clone(), queue.clone());

        let job = pending_job(store.as_ref(), 10, 10).await;
        queue.push(job.job_id).await.unwrap();
        let t = job.created_at;

        let mut requeued = 0;
        for minute in 6..=15 {
            requeued += reaper.sweep(t + chrono::Duration::minutes(minute)).await.requeued;
        }

        // Re-enqueued at t+6 and again at t+12, five minutes after the stamp.
        assert_eq!(requeued, 2);
        assert_eq!(queue.len(), 3);
        let stored = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.requeued_at, Some(t + chrono::Duration::minutes(12)));
    }

    #[tokio::test]
    async fn concurrent_sweeps_requeue_an_orphan_once() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let first = reaper(store.clone(), queue.clone());
        let second = reaper(store.clone(), queue.clone());

        let job = pending_job(store.as_ref(), 10, 10).await;
        let at = job.created_at + chrono::Duration::minutes(6);

        let (a, b) = tokio::join!(first.sweep(at), second.sweep(at));
        assert_eq!(a.requeued + b.requeued, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn store_error_on_one_job_does_not_stop_the_sweep() {
        let store = Arc::new(FlakyStore::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = StaleJobReaper::new(
            store.clone(),
            JobLifecycle::new(store.clone(), RetryPolicy::no_retry()),
            JobDispatcher::new(queue.clone()),
            ReaperConfig::default(),
        );
        let t = Utc::now() - chrono::Duration::minutes(30);

        let broken = pending_job(&store.inner, 10, 10).await;
        claim_at(&store.inner, &broken, t).await;
        store.break_job(broken.job_id);
        let healthy = pending_job(&store.inner, 10, 10).await;
        claim_at(&store.inner, &healthy, t + chrono::Duration::seconds(1)).await;
        let orphan = pending_job(&store.inner, 10, 10).await;

        let report = reaper.sweep(Utc::now() + chrono::Duration::minutes(6)).await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.reaped, 1);
        assert_eq!(report.requeued, 1);
        let stored = store.get_job(healthy.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.refunded);
        let delivery = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, orphan.job_id);
    }

    #[tokio::test]
    async fn oversized_thresholds_do_not_panic() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reaper = StaleJobReaper::new(
            store.clone(),
            JobLifecycle::new(store.clone(), RetryPolicy::no_retry()),
            JobDispatcher::new(queue.clone()),
            ReaperConfig {
                stale_after: chrono::Duration::MAX,
                requeue_after: chrono::Duration::MAX,
                ..ReaperConfig::default()
            },
        );
        let job = pending_job(store.as_ref(), 10, 10).await;
        claim_at(&store, &job, Utc::now()).await;

        assert_eq!(reaper.sweep(Utc::now()).await, SweepReport::default());
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_and_reaper_race_refunds_once() {
        for _ in 0..20 {
            let store = Arc::new(InMemoryStore::new());
            let queue = Arc::new(InMemoryJobQueue::new());
            let generator = Arc::new(ScriptedGenerator::new(vec![Step::Hang("s3://slow")]));
            let pool = WorkerPool::new(
                store.clone(),
                queue.clone(),
                generator.clone(),
                JobLifecycle::new(store.clone(), RetryPolicy::no_retry()),
            );
            let reaper = reaper(store.clone(), queue.clone());

            let job = pending_job(store.as_ref(), 10, 10).await;
            let delivery = Delivery { job_id: job.job_id, receipt: String::new() };
            let worker = tokio::spawn(async move { pool.process("w", &delivery).await.unwrap() });

            while generator.calls() == 0 {
                tokio::task::yield_now().await;
            }
            let far_future = Utc::now() + chrono::Duration::minutes(20);
            let sweep = tokio::spawn(async move { reaper.sweep(far_future).await });
            generator.release();

            let outcome = worker.await.unwrap();
            let report = sweep.await.unwrap();

            let stored = store.get_job(job.job_id).await.unwrap().unwrap();
            let balance = store.account(job.user_id).await.unwrap().unwrap().balance;
            match stored.status {
                JobStatus::Completed => {
                    assert_eq!(outcome, JobOutcome::Completed);
                    assert_eq!(report.reaped, 0);
                    assert_eq!(balance, 0);
                }
                JobStatus::Failed => {
                    assert_eq!(outcome, JobOutcome::Discarded);
                    assert_eq!(report.reaped, 1);
                    assert!(stored.refunded);
                    assert_eq!(balance, 10);
                }
                other => panic!("job left in {other}"),
            }
            assert_eq!(
                replay_balance(&store.entries(job.user_id, 100).await.unwrap()),
                balance as i128
            );
        }
    }
}
