use dashmap::DashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::SendError;

/// Stable identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a live connection: its id, the queue its writer drains, and a
/// close signal the transport watches.
///
/// Dropping every clone of the handle closes the queue, which ends the
/// transport's writer and with it the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    close: CancellationToken,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
            close: CancellationToken::new(),
        }
    }

    /// Create a connection together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame without waiting.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        match self.outbound.try_send(text.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Ask the transport to end this connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

struct Entry {
    conn: Connection,
    next_due: Instant,
}

/// Per-process map of live connections to their next scheduled broadcast.
///
/// Never shared across processes. Snapshots returned by [`all`](Self::all)
/// are copies, so callers may register or unregister while iterating one.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Entry>,
    first_due: Duration,
}

impl ConnectionRegistry {
    /// `first_due` is how long after registration a connection gets its
    /// first scheduled broadcast.
    pub fn new(first_due: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            first_due,
        }
    }

    pub fn register(&self, conn: Connection) {
        let id = conn.id();
        let next_due = Instant::now() + self.first_due;
        self.connections.insert(id, Entry { conn, next_due });
        tracing::debug!(conn_id = %id, count = self.len(), "Registered connection");
    }

    /// Remove a connection. Safe to call for ids that are already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            tracing::debug!(conn_id = %id, count = self.len(), "Unregistered connection");
        }
        removed
    }

    pub fn has_any(&self) -> bool {
        !self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Point-in-time copy of every (connection, next_due) pair.
    pub fn all(&self) -> Vec<(Connection, Instant)> {
        self.connections
            .iter()
            .map(|entry| (entry.conn.clone(), entry.next_due))
            .collect()
    }

    pub fn next_due(&self, id: ConnectionId) -> Option<Instant> {
        self.connections.get(&id).map(|entry| entry.next_due)
    }

    /// Move a connection's next scheduled broadcast. No-op if it has
    /// disconnected in the meantime.
    pub fn reschedule(&self, id: ConnectionId, next_due: Instant) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                entry.next_due = next_due;
                true
            }
            None => false,
        }
    }

    /// Send a frame; a connection that cannot take it is unregistered and
    /// told to close, so it never lingers outside the registry.
    pub fn deliver(&self, conn: &Connection, text: &str) -> bool {
        match conn.send(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), reason = %e, "Send failed, dropping connection");
                self.unregister(conn.id());
                conn.close();
                false
            }
        }
    }
}
