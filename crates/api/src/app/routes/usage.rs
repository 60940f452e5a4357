use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub async fn get_usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(feature): Path<String>,
) -> axum::response::Response {
    match services
        .jobs
        .limiter()
        .snapshot(user.user_id(), user.tier(), &feature, Utc::now())
        .await
    {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(dto::usage_to_json(&snapshot))).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown feature: {feature}"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}
