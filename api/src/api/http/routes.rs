use axum::{http::Uri, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::api::http::{health, socket};
use crate::error::ApiError;
use crate::state::BeaconState;

/// Build the worker's router: `/ws` for clients, `/health` for health checks.
pub fn beacon_routes(state: BeaconState) -> Router {
    tracing::debug!("Building routes");

    Router::new()
        .route("/ws", get(socket::ws_handler))
        .route("/health", get(health::health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}
