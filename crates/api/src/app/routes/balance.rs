use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

const DEFAULT_RECENT: usize = 20;
const MAX_RECENT: usize = 200;

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::BalanceQuery>,
) -> axum::response::Response {
    let recent = query.recent.unwrap_or(DEFAULT_RECENT).min(MAX_RECENT);
    match services.ledger.view(user.user_id(), recent).await {
        Ok(view) => (StatusCode::OK, Json(dto::balance_to_json(&view))).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
