use axum::{
    routing::{get, post},
    Router,
};

pub mod sync;
pub mod system;
pub mod units;

/// Router for the command, query and sync surface.
pub fn router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .route("/moves", post(units::move_unit))
        .nest("/units", units::router())
        .nest("/sync", sync::router())
}
