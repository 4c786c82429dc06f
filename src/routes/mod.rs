//! Route modules for the DriftSync server

pub mod health;
pub mod sync;

use axum::{http::header, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::sync::{X_RECORD_COUNT, X_SYNC_CURSOR, X_SYNC_STRATEGY};

/// Build the full application router
pub fn app(state: AppState) -> Router {
    // Browser clients need to read the sync headers
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::ETAG, X_SYNC_CURSOR, X_RECORD_COUNT, X_SYNC_STRATEGY]);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
