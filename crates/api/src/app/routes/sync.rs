use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use tagtrail_core::MovementId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/retry-queue", get(retry_queue))
        .route("/retry-queue/:record_id/requeue", post(requeue))
        .route("/run", post(run_now))
}

pub async fn retry_queue(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.reconciler.retry_entries().await {
        Ok(entries) => {
            let items: Vec<_> = entries.iter().map(dto::retry_entry_to_json).collect();
            Json(serde_json::json!({ "items": items })).into_response()
        }
        Err(e) => errors::reconcile_error_to_response(e),
    }
}

/// POST /sync/run
///
/// Forced cycle: ignores backoff and rejection holds.
pub async fn run_now(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.reconciler.run_cycle(true).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::reconcile_error_to_response(e),
    }
}

pub async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(record_id): Path<String>,
) -> axum::response::Response {
    let record_id: MovementId = match record_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_argument",
                format!("'{record_id}' is not a record id"),
            );
        }
    };

    match services.reconciler.requeue(record_id).await {
        Ok(true) => StatusCode::ACCEPTED.into_response(),
        Ok(false) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("record {record_id} is not in the retry queue"),
        ),
        Err(e) => errors::reconcile_error_to_response(e),
    }
}
