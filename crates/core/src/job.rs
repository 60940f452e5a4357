//! Generation jobs and their state machine.
//!
//! ```text
//! Pending --claim--> Processing --success--> Completed
//!                    Processing --failure | timeout--> Failed
//! ```
//!
//! Completed and Failed are terminal. Every successful transition bumps
//! `version`, which is what conditional store updates compare against.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created together with its debit, waiting for a worker.
    Pending,
    /// Claimed by exactly one worker; the external call is in flight.
    Processing,
    /// Result recorded.
    Completed,
    /// Failure recorded; the cost is refunded.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Completed) => true,
            (JobStatus::Processing, JobStatus::Failed) => true,
            (JobStatus::Pending, _)
            | (JobStatus::Processing, _)
            | (JobStatus::Completed, _)
            | (JobStatus::Failed, _) => false,
        }
    }

    fn ensure_transition(&self, next: JobStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition { from: *self, to: next })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque payload handed to the generation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub feature: String,
    pub prompt: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl GenerationRequest {
    pub fn new(feature: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            prompt: prompt.into(),
            params: empty_params(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Shape checks that do not depend on the feature catalog.
    pub fn validate(&self, max_prompt_chars: usize) -> DomainResult<()> {
        if self.feature.trim().is_empty() {
            return Err(DomainError::validation("feature must not be empty"));
        }
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(DomainError::validation("prompt must not be empty"));
        }
        if prompt.chars().count() > max_prompt_chars {
            return Err(DomainError::validation(format!(
                "prompt exceeds {max_prompt_chars} characters"
            )));
        }
        if !self.params.is_object() {
            return Err(DomainError::validation("params must be a JSON object"));
        }
        Ok(())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The collaborator returned an error.
    Collaborator,
    /// The collaborator task panicked.
    Crashed,
    /// The reaper found the job in flight past the staleness threshold.
    Stale,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Collaborator => "collaborator",
            FailureKind::Crashed => "crashed",
            FailureKind::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collaborator" => Some(FailureKind::Collaborator),
            "crashed" => Some(FailureKind::Crashed),
            "stale" => Some(FailureKind::Stale),
            _ => None,
        }
    }
}

/// Human-readable failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Collaborator,
            message: message.into(),
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Crashed,
            message: message.into(),
        }
    }

    pub fn stale(threshold: Duration) -> Self {
        Self {
            kind: FailureKind::Stale,
            message: format!(
                "generation did not finish within {} minutes",
                threshold.num_minutes()
            ),
        }
    }
}

/// One requested unit of billed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: JobId,
    pub user_id: UserId,
    pub status: JobStatus,
    /// Tokens debited at submission.
    pub cost: u64,
    pub request: GenerationRequest,
    pub result_ref: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Number of successful claims (0 while pending).
    pub attempt: u32,
    pub refunded: bool,
    pub version: u64,
    /// Last time the reaper put this job back on the queue.
    #[serde(default)]
    pub requeued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// A new pending job. Only valid when persisted together with its debit.
    pub fn pending(
        user_id: UserId,
        request: GenerationRequest,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            user_id,
            status: JobStatus::Pending,
            cost,
            request,
            result_ref: None,
            error_info: None,
            claimed_at: None,
            attempt: 0,
            refunded: false,
            version: 0,
            requeued_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn feature(&self) -> &str {
        &self.request.feature
    }

    /// Pending -> Processing.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.claimed_at = Some(now);
        self.attempt += 1;
        self.touch(now);
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        result_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result_ref = Some(result_ref.into());
        self.touch(now);
        Ok(())
    }

    /// Processing -> Failed. The refund is a separate atomic step.
    pub fn fail(&mut self, error: ErrorInfo, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error_info = Some(error);
        self.touch(now);
        Ok(())
    }

    /// Flip `refunded` false -> true. Only failed jobs are refundable.
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Failed {
            return Err(DomainError::invariant(format!(
                "job {} is {}, only failed jobs are refundable",
                self.job_id, self.status
            )));
        }
        if self.refunded {
            return Err(DomainError::conflict(format!("job {} already refunded", self.job_id)));
        }
        self.refunded = true;
        self.touch(now);
        Ok(())
    }

    /// Failed but the refund has not landed yet.
    pub fn refund_due(&self) -> bool {
        self.status == JobStatus::Failed && !self.refunded
    }

    /// When the job last went onto the queue.
    pub fn last_enqueued_at(&self) -> DateTime<Utc> {
        self.requeued_at.unwrap_or(self.created_at)
    }

    /// Still pending and last enqueued before `cutoff`.
    pub fn requeue_due(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.last_enqueued_at() < cutoff
    }

    /// Stamp a re-enqueue. Does not bump `version`: an earlier delivery can
    /// still claim the job.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.requeued_at = Some(now);
        self.updated_at = now;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> GenerationJob {
        let request = GenerationRequest::new("image", "a red fox");
        GenerationJob::pending(UserId::new(), request, 10, Utc::now())
    }

    #[test]
    fn happy_path_bumps_version_each_step() {
        let mut job = job();
        assert_eq!(job.version, 0);

        job.claim(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.version, 1);
        assert!(job.claimed_at.is_some());

        job.complete("s3://bucket/out.png", Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_ref.as_deref(), Some("s3://bucket/out.png"));
        assert_eq!(job.version, 2);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = job();
        job.claim(Utc::now()).unwrap();
        job.fail(ErrorInfo::collaborator("boom"), Utc::now()).unwrap();

        assert!(matches!(
            job.complete("late", Utc::now()),
            Err(DomainError::IllegalTransition {
                from: JobStatus::Failed,
                to: JobStatus::Completed,
            })
        ));
        assert!(job.claim(Utc::now()).is_err());
        assert!(job.fail(ErrorInfo::collaborator("again"), Utc::now()).is_err());
    }

    #[test]
    fn pending_cannot_skip_processing() {
        let mut job = job();
        assert!(job.complete("x", Utc::now()).is_err());
        assert!(job.fail(ErrorInfo::collaborator("x"), Utc::now()).is_err());
        assert_eq!(job.version, 0);
    }

    #[test]
    fn refund_flag_flips_once_and_only_when_failed() {
        let mut job = job();
        job.claim(Utc::now()).unwrap();
        assert!(job.mark_refunded(Utc::now()).is_err());

        job.fail(ErrorInfo::collaborator("boom"), Utc::now()).unwrap();
        assert!(job.refund_due());
        job.mark_refunded(Utc::now()).unwrap();
        assert!(!job.refund_due());
        assert!(matches!(job.mark_refunded(Utc::now()), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn requeue_due_follows_the_last_enqueue() {
        let mut job = job();
        let t = job.created_at;

        assert!(!job.requeue_due(t));
        assert!(job.requeue_due(t + Duration::minutes(6)));

        job.mark_requeued(t + Duration::minutes(6));
        assert_eq!(job.version, 0);
        assert!(!job.requeue_due(t + Duration::minutes(6)));
        assert!(job.requeue_due(t + Duration::minutes(12)));

        job.claim(t + Duration::minutes(13)).unwrap();
        assert!(!job.requeue_due(t + Duration::minutes(60)));
    }

    #[test]
    fn request_validation() {
        assert!(GenerationRequest::new("image", "ok").validate(10).is_ok());
        assert!(GenerationRequest::new("image", "   ").validate(10).is_err());
        assert!(GenerationRequest::new("", "ok").validate(10).is_err());
        assert!(GenerationRequest::new("image", "much too long").validate(5).is_err());
        assert!(GenerationRequest::new("image", "ok")
            .with_params(serde_json::json!([1, 2]))
            .validate(10)
            .is_err());
    }

    #[test]
    fn missing_params_deserialize_as_empty_object() {
        let req: GenerationRequest =
            serde_json::from_value(serde_json::json!({"feature": "image", "prompt": "cat"}))
                .unwrap();
        assert!(req.params.as_object().unwrap().is_empty());
    }
}
