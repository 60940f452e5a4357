//! External generation collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use tokenmill_core::{GenerationRequest, JobId};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(String),

    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation service returned an unreadable response: {0}")]
    InvalidResponse(String),

    #[error("generation rejected: {0}")]
    Rejected(String),
}

/// Turns a generation request into a result reference. Latency is unbounded.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError>;
}

/// Calls an HTTP generation service.
///
/// `POST {endpoint}` with `{job_id, feature, prompt, params}` and expects
/// `{"result_ref": "..."}` back.
#[derive(Debug, Clone)]
pub struct HttpGenerationClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    result_ref: String,
}

impl HttpGenerationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(
        &self,
        job_id: JobId,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "job_id": job_id,
                "feature": request.feature,
                "prompt": request.prompt,
                "params": request.params,
            }))
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerationResponse = res
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        if body.result_ref.trim().is_empty() {
            return Err(GenerationError::InvalidResponse("empty result_ref".to_string()));
        }
        Ok(body.result_ref)
    }
}
