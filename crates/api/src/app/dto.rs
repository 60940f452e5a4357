use serde::Deserialize;
use serde_json::json;

use tokenmill_core::{GenerationJob, GenerationRequest, JobStatus, LedgerEntry};
use tokenmill_infra::jobs::SubmittedJob;
use tokenmill_infra::{BalanceView, UsageSnapshot};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub feature: String,
    pub prompt: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl SubmitJobRequest {
    pub fn into_request(self) -> GenerationRequest {
        let request = GenerationRequest::new(self.feature, self.prompt);
        match self.params {
            Some(params) => request.with_params(params),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub recent: Option<usize>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn submitted_to_json(job: &SubmittedJob) -> serde_json::Value {
    json!({
        "job_id": job.job_id.to_string(),
        "cost": job.cost,
        "status": job.status.as_str(),
        "balance": job.balance,
    })
}

pub fn job_to_json(job: &GenerationJob) -> serde_json::Value {
    let mut body = json!({
        "job_id": job.job_id.to_string(),
        "feature": job.feature(),
        "status": job.status.as_str(),
        "cost": job.cost,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    });
    match job.status {
        JobStatus::Completed => {
            body["result_ref"] = json!(job.result_ref);
        }
        JobStatus::Failed => {
            body["error_info"] = json!(job.error_info.as_ref().map(|e| json!({
                "kind": e.kind.as_str(),
                "message": e.message,
            })));
            body["refunded"] = json!(job.refunded);
        }
        JobStatus::Pending | JobStatus::Processing => {}
    }
    body
}

pub fn entry_to_json(entry: &LedgerEntry) -> serde_json::Value {
    json!({
        "entry_id": entry.entry_id.to_string(),
        "kind": entry.kind.as_str(),
        "amount": entry.amount,
        "idempotency_key": entry.idempotency_key.as_str(),
        "created_at": entry.created_at,
    })
}

pub fn balance_to_json(view: &BalanceView) -> serde_json::Value {
    json!({
        "user_id": view.user_id.to_string(),
        "balance": view.balance,
        "recent": view.recent.iter().map(entry_to_json).collect::<Vec<_>>(),
    })
}

pub fn usage_to_json(snapshot: &UsageSnapshot) -> serde_json::Value {
    json!({
        "feature": snapshot.feature,
        "period": snapshot.period_key.as_str(),
        "count": snapshot.count,
        "limit": snapshot.limit,
        "remaining": snapshot.limit.saturating_sub(snapshot.count),
    })
}
