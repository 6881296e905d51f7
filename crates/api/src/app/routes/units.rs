use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use tagtrail_infra::transition_engine::MoveRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(provision_unit).get(list_units))
        .route("/:tag_id", get(get_unit))
        .route("/:tag_id/movements", get(unit_movements))
}

/// POST /units
///
/// Out-of-band provisioning; units normally arrive from an intake process.
pub async fn provision_unit(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::ProvisionUnitRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::body_rejection_to_response(rejection),
    };
    match services
        .engine
        .provision(&body.tag_id, &body.location, body.status.as_deref())
        .await
    {
        Ok(unit) => (StatusCode::CREATED, Json(dto::unit_to_json(&unit))).into_response(),
        Err(e) => errors::move_error_to_response(e),
    }
}

pub async fn list_units(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.engine.units().await {
        Ok(units) => {
            let items: Vec<_> = units.iter().map(dto::unit_to_json).collect();
            Json(serde_json::json!({ "items": items })).into_response()
        }
        Err(e) => errors::move_error_to_response(e),
    }
}

pub async fn get_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tag_id): Path<String>,
) -> axum::response::Response {
    match services.engine.unit(&tag_id).await {
        Ok(unit) => Json(dto::unit_to_json(&unit)).into_response(),
        Err(e) => errors::move_error_to_response(e),
    }
}

pub async fn unit_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tag_id): Path<String>,
) -> axum::response::Response {
    match services.engine.history(&tag_id).await {
        Ok(records) => {
            let items: Vec<_> = records.iter().map(dto::record_to_json).collect();
            Json(serde_json::json!({ "tag_id": tag_id, "items": items })).into_response()
        }
        Err(e) => errors::move_error_to_response(e),
    }
}

/// POST /moves
///
/// 201 with the committed record. The external sync outcome is never part
/// of this response; follow it via `/units/:tag_id/movements`.
pub async fn move_unit(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::MoveUnitRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::body_rejection_to_response(rejection),
    };
    let request = MoveRequest::new(body.tag_id, body.from_location, body.to_location);

    match services.engine.move_unit(request).await {
        Ok(record) => (StatusCode::CREATED, Json(dto::record_to_json(&record))).into_response(),
        Err(e) => errors::move_error_to_response(e),
    }
}
