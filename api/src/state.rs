use cluster_broadcast::{Broadcaster, ConnectionRegistry};
use std::sync::Arc;

/// Outbound frames buffered per connection before sends count as failures.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Per-worker state shared by every handler.
///
/// Built once at startup and handed to the router, so tests can run several
/// independent workers in one process.
#[derive(Clone)]
pub struct BeaconState {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub outbound_capacity: usize,
}

impl BeaconState {
    pub fn new(registry: Arc<ConnectionRegistry>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}
