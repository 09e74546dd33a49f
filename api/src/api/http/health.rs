use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::BeaconState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mode: &'static str,
    pub pid: u32,
    pub connections: usize,
}

/// Liveness plus a snapshot of this worker's load.
pub async fn health(State(state): State<BeaconState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mode: state.broadcaster.mode().as_str(),
        pid: std::process::id(),
        connections: state.registry.len(),
    })
}
