//! Generation job pipeline.
//!
//! - `service`: submission (limiter, debit + job, enqueue) and lookup
//! - `dispatcher`: enqueue with a [`RetryPolicy`]
//! - `worker`: the worker pool that claims and runs jobs
//! - `lifecycle`: the Failed + refund path shared with the reaper
//! - `generation`: the external generation collaborator

pub mod dispatcher;
pub mod generation;
pub mod lifecycle;
pub mod retry;
pub mod service;
pub mod worker;

pub use dispatcher::JobDispatcher;
pub use generation::{GenerationClient, GenerationError, HttpGenerationClient};
pub use lifecycle::{FailureResolution, JobLifecycle};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use service::{JobService, SubmitConfig, SubmitError, SubmittedJob};
pub use worker::{JobOutcome, PoolStats, WorkerConfig, WorkerPool, WorkerPoolHandle};
