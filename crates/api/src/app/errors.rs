use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use tagtrail_infra::reconcile::ReconcileError;
use tagtrail_infra::transition_engine::MoveError;

pub fn move_error_to_response(err: MoveError) -> axum::response::Response {
    match err {
        MoveError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        MoveError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        MoveError::InvalidArgument(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_argument", msg)
        }
        MoveError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

/// Malformed or incomplete request bodies are the caller's error, reported
/// in the same JSON shape as every other failure.
pub fn body_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_argument",
        rejection.body_text(),
    )
}

pub fn reconcile_error_to_response(err: ReconcileError) -> axum::response::Response {
    tracing::error!(error = %err, "sync operation failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "sync_error",
        err.to_string(),
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
