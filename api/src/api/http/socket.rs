// ABOUTME: WebSocket endpoint: registers each connection and runs its reader and writer halves
// ABOUTME: Inbound text frames are parsed into Frame and answered through the connection's outbound queue

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use cluster_broadcast::{Connection, ConnectionRegistry};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::BeaconState;

/// Reply to a `send_now` request.
pub const IMMEDIATE_REPLY: &str = "Immediate message sent";
/// Reply to an application-level `ping`.
pub const PONG_REPLY: &str = "pong";

/// Inbound text frame understood by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    SendNow,
    Ping,
    Other,
}

impl Frame {
    /// Frames are matched verbatim; surrounding whitespace is not trimmed.
    pub fn parse(text: &str) -> Self {
        match text {
            "send_now" => Frame::SendNow,
            "ping" => Frame::Ping,
            _ => Frame::Other,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<BeaconState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BeaconState) {
    let (conn, outbound) = Connection::channel(state.outbound_capacity);
    let conn_id = conn.id();
    state.registry.register(conn.clone());
    tracing::info!(conn_id = %conn_id, count = state.registry.len(), "WebSocket connection opened");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound));
    let mut reader = tokio::spawn(read_loop(stream, conn.clone(), state.clone()));

    // Whichever half finishes first takes the other down with it. A failed
    // send also ends the connection, so it never outlives its registration.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        _ = conn.closed() => {
            tracing::info!(conn_id = %conn_id, "Closing connection after failed send");
            reader.abort();
            writer.abort();
        }
    }

    state.registry.unregister(conn_id);
    tracing::info!(conn_id = %conn_id, count = state.registry.len(), "WebSocket connection closed");
}

/// Drain the outbound queue into the socket until the queue closes or a
/// write fails.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<String>) {
    while let Some(text) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, conn: Connection, state: BeaconState) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&state, &conn, Frame::parse(text.as_str())),
            Ok(Message::Close(_)) => break,
            // axum answers protocol pings itself
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), "WebSocket read failed: {}", e);
                break;
            }
        }
    }
}

fn dispatch(state: &BeaconState, conn: &Connection, frame: Frame) {
    match frame {
        Frame::SendNow => {
            // Marked before the reply goes out so the next relay skips this connection
            state.broadcaster.mark_recent(conn.id());
            if reply(&state.registry, conn, IMMEDIATE_REPLY) {
                tracing::info!(conn_id = %conn.id(), "Sent immediate message");
            }
        }
        Frame::Ping => {
            reply(&state.registry, conn, PONG_REPLY);
        }
        Frame::Other => {
            tracing::trace!(conn_id = %conn.id(), "Ignoring unrecognised frame");
        }
    }
}

fn reply(registry: &ConnectionRegistry, conn: &Connection, text: &str) -> bool {
    registry.deliver(conn, text)
}
