use axum::{
    Router,
    routing::{get, post},
};

pub mod balance;
pub mod jobs;
pub mod system;
pub mod usage;
pub mod webhooks;

/// Router for all authenticated (per-user) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/balance", get(balance::get_balance))
        .route("/usage/:feature", get(usage::get_usage))
        .nest("/jobs", jobs::router())
}

/// Endpoints called by other systems; they authenticate per request.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/webhooks/payment", post(webhooks::payment))
}
