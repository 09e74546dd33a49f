// ABOUTME: Transport layer for beacon workers: axum router, WebSocket endpoint, frame dispatch
// ABOUTME: Connections are registered into the shared ConnectionRegistry and replies go through their queue

pub mod api;
pub mod error;
pub mod server;
pub mod state;
