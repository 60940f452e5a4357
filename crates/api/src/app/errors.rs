use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use tokenmill_infra::jobs::SubmitError;
use tokenmill_infra::store::StoreError;
use tokenmill_infra::{LedgerError, WebhookError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        SubmitError::InsufficientFunds { available, required } => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_tokens",
            format!("{available} tokens available, {required} required"),
        ),
        SubmitError::LimitExceeded { feature, limit } => json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "limit_exceeded",
            format!("{feature} is limited to {limit} per period"),
        ),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn webhook_error_to_response(err: WebhookError) -> axum::response::Response {
    match err {
        WebhookError::InvalidSignature => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_signature", "signature check failed")
        }
        WebhookError::Malformed(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        WebhookError::Store(e) => store_error_to_response(e),
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        LedgerError::ZeroAmount => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", "amount must be positive")
        }
        LedgerError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    error!(error = %err, "store error");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "storage unavailable")
}

pub fn json_error(
    status: StatusCode,
    reason: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "reason": reason,
            "message": message.into(),
        })),
    )
        .into_response()
}
