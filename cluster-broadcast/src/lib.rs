//! Broadcast coordination for WebSocket worker processes.
//!
//! This crate provides:
//! - A per-process connection registry with per-connection broadcast schedules
//! - A single-process broadcaster (1s scan, 10s period per connection)
//! - A cross-process broadcaster for N workers sharing one port:
//!   - Redis lease (`SET NX EX`) electing one publisher per cycle
//!   - Heartbeat keys telling the leader whether anyone has connections
//!   - Redis Pub/Sub relay to local connections, skipping the ones that just
//!     got an immediate reply
//! - A drain coordinator bounding how long a worker waits for its
//!   connections after a termination signal
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_broadcast::{BroadcastConfig, Broadcaster, ConnectionRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BroadcastConfig::from_env();
//!     config.validate()?;
//!
//!     let registry = Arc::new(ConnectionRegistry::new(config.broadcast_period));
//!
//!     // Local scanner for one worker, Redis coordination for several
//!     let broadcaster = Broadcaster::select(&config, registry.clone())?;
//!     broadcaster.start();
//!
//!     // Transport registers connections and forwards `send_now` marks
//!     // via broadcaster.mark_recent(conn.id())
//!     Ok(())
//! }
//! ```
//!
//! # Cadence
//!
//! - Heartbeat: 5s, key TTL 15s
//! - Leadership cycle: 10s, lease TTL 15s
//! - Drain: poll every 5s, give up after 60s
//!
//! # Failure Handling
//!
//! - **Send failure**: the connection is dropped from the registry, nothing retried
//! - **Redis failure**: leadership belief is dropped, retried on the next cycle
//! - **Leader crash**: lease expires within 15s, another worker takes over

mod config;
mod coordinator;
mod error;
mod local;
mod registry;
mod shutdown;
mod store;
mod strategy;

pub use config::{BroadcastConfig, BroadcastMode, DEFAULT_CHANNEL};
pub use coordinator::{ClusterBroadcaster, CoordinationEvent, RelayStats};
pub use error::{Error, SendError};
pub use local::LocalBroadcaster;
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use shutdown::{DrainCoordinator, DrainOutcome, ShutdownPhase};
pub use store::{CoordinationStore, KeySpace};
pub use strategy::Broadcaster;

/// Text of every scheduled broadcast.
pub const SCHEDULED_BROADCAST: &str = "Scheduled broadcast";
