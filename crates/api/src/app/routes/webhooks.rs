use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;

use tokenmill_infra::store::WebhookOutcome;

use crate::app::errors;
use crate::app::services::AppServices;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-tokenmill-signature";

pub async fn payment(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match services.webhooks.handle_signed(&body, signature, Utc::now()).await {
        Ok(WebhookOutcome::Processed { .. }) => {
            (StatusCode::OK, Json(json!({ "status": "processed" }))).into_response()
        }
        Ok(WebhookOutcome::Duplicate) => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response()
        }
        Err(e) => errors::webhook_error_to_response(e),
    }
}
