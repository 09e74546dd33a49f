use crate::{
    BroadcastConfig, ConnectionId, ConnectionRegistry, CoordinationStore, Error, KeySpace,
    SCHEDULED_BROADCAST,
};
use dashmap::DashSet;
use futures_util::StreamExt;
use redis::aio::PubSub;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Coordination event, emitted for observers such as tests and health checks.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationEvent {
    /// The relay loop is subscribed and will see the next publication.
    Subscribed,
    LeadershipAcquired,
    LeadershipLost,
    /// This process, as leader, published a broadcast cycle.
    Published { active_workers: usize },
    /// A leader cycle found no process with connections.
    Skipped,
    /// A relayed broadcast was fanned out to local connections.
    Relayed { delivered: usize, skipped: usize },
}

/// Outcome of one pass of the leadership loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderCycle {
    Follower,
    LeaseLost,
    Skipped,
    Published { active_workers: usize },
}

/// Counts from fanning one relayed message out to local connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// Broadcaster for one of several worker processes.
///
/// Three tasks run per process:
/// - relay: subscribes to the broadcast channel and forwards each message to
///   local connections, except the ones marked as recently notified
/// - leadership: holds (or tries to take) the `broadcast_lock` lease and,
///   while leader, publishes one broadcast per cycle if any process reports
///   connections
/// - heartbeat: keeps `active_clients:<pid>` alive while this process has
///   connections and deletes it when it has none
///
/// Redis is the only shared state. A lapsed lease may briefly give two
/// processes the leader belief; the worst case is one duplicate cycle.
pub struct ClusterBroadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<CoordinationStore>,
    redis_url: String,
    recently_notified: Arc<DashSet<ConnectionId>>,
    is_leader: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    leader_interval: Duration,
    started: AtomicBool,
    cancel_token: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    event_tx: broadcast::Sender<CoordinationEvent>,
}

impl ClusterBroadcaster {
    /// Build against the configured key space.
    ///
    /// No connection is made here: each loop dials Redis on its own cadence,
    /// so a Redis outage at startup only delays coordination.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis URL is invalid.
    pub fn new(config: &BroadcastConfig, registry: Arc<ConnectionRegistry>) -> Result<Self, Error> {
        Self::with_keys(config, registry, KeySpace::from_config(config))
    }

    /// Build with an explicit key space (for test isolation).
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis URL is invalid.
    pub fn with_keys(
        config: &BroadcastConfig,
        registry: Arc<ConnectionRegistry>,
        keys: KeySpace,
    ) -> Result<Self, Error> {
        let store = CoordinationStore::new(&config.redis_url, keys, config.lease_ttl)?;
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            registry,
            store: Arc::new(store),
            redis_url: config.redis_url.clone(),
            recently_notified: Arc::new(DashSet::new()),
            is_leader: Arc::new(AtomicBool::new(false)),
            heartbeat_interval: config.heartbeat_interval,
            leader_interval: config.leader_interval,
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            event_tx,
        })
    }

    /// Spawn the relay, leadership and heartbeat tasks. Calling it again is
    /// a no-op.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let relay = Self::spawn_relay_task(
            self.redis_url.clone(),
            self.store.keys().channel(),
            self.registry.clone(),
            self.recently_notified.clone(),
            self.cancel_token.clone(),
            self.event_tx.clone(),
        );
        let leadership = Self::spawn_leadership_task(
            self.store.clone(),
            self.is_leader.clone(),
            self.leader_interval,
            self.cancel_token.clone(),
            self.event_tx.clone(),
        );
        let heartbeat = Self::spawn_heartbeat_task(
            self.store.clone(),
            self.registry.clone(),
            self.heartbeat_interval,
            self.cancel_token.clone(),
        );

        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([relay, leadership, heartbeat]);

        tracing::info!(
            instance_id = self.store.instance_id(),
            process_id = self.store.keys().process_id(),
            "Cluster broadcaster started"
        );
    }

    /// Exempt a connection from the next relayed broadcast.
    ///
    /// Called before the immediate reply is sent. A relay already in
    /// progress may still reach the connection.
    pub fn mark_recent(&self, id: ConnectionId) {
        self.recently_notified.insert(id);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn instance_id(&self) -> &str {
        self.store.instance_id()
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    /// Subscribe to coordination events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.event_tx.subscribe()
    }

    fn spawn_relay_task(
        redis_url: String,
        channel: String,
        registry: Arc<ConnectionRegistry>,
        recently_notified: Arc<DashSet<ConnectionId>>,
        cancel_token: CancellationToken,
        event_tx: broadcast::Sender<CoordinationEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let client = match redis::Client::open(redis_url.as_str()) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("Failed to create Redis client for Pub/Sub: {}", e);
                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                };

                let conn = match client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("Failed to get Pub/Sub connection: {}", e);
                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                };

                if let Err(e) = Self::run_relay_loop(
                    conn,
                    &channel,
                    &registry,
                    &recently_notified,
                    &cancel_token,
                    &event_tx,
                )
                .await
                {
                    if !cancel_token.is_cancelled() {
                        tracing::warn!("Relay loop error, reconnecting: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
            tracing::debug!("Relay task shutting down");
        })
    }

    async fn run_relay_loop(
        mut pubsub: PubSub,
        channel: &str,
        registry: &ConnectionRegistry,
        recently_notified: &DashSet<ConnectionId>,
        cancel_token: &CancellationToken,
        event_tx: &broadcast::Sender<CoordinationEvent>,
    ) -> Result<(), Error> {
        pubsub.subscribe(channel).await?;
        tracing::debug!("Subscribed to {}", channel);
        let _ = event_tx.send(CoordinationEvent::Subscribed);

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::warn!("Failed to get Pub/Sub payload: {}", e);
                                    continue;
                                }
                            };

                            let stats = relay(registry, recently_notified, &payload);
                            tracing::info!(
                                delivered = stats.delivered,
                                skipped = stats.skipped,
                                dropped = stats.dropped,
                                "Relayed broadcast"
                            );
                            let _ = event_tx.send(CoordinationEvent::Relayed {
                                delivered: stats.delivered,
                                skipped: stats.skipped,
                            });
                        }
                        None => {
                            return Err(Error::Connection("Pub/Sub stream ended".to_string()));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_leadership_task(
        store: Arc<CoordinationStore>,
        is_leader: Arc<AtomicBool>,
        leader_interval: Duration,
        cancel_token: CancellationToken,
        event_tx: broadcast::Sender<CoordinationEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(leader_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Leadership task shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        let was_leader = is_leader.load(Ordering::Acquire);
                        match run_leadership_cycle(&store, &is_leader).await {
                            Ok(cycle) => {
                                if !was_leader && is_leader.load(Ordering::Acquire) {
                                    let _ = event_tx.send(CoordinationEvent::LeadershipAcquired);
                                }
                                match cycle {
                                    LeaderCycle::Published { active_workers } => {
                                        let _ = event_tx.send(CoordinationEvent::Published { active_workers });
                                    }
                                    LeaderCycle::Skipped => {
                                        let _ = event_tx.send(CoordinationEvent::Skipped);
                                    }
                                    LeaderCycle::LeaseLost => {
                                        let _ = event_tx.send(CoordinationEvent::LeadershipLost);
                                    }
                                    LeaderCycle::Follower => {}
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    instance_id = store.instance_id(),
                                    "Leadership cycle failed: {}",
                                    e
                                );
                                if is_leader.swap(false, Ordering::AcqRel) {
                                    let _ = event_tx.send(CoordinationEvent::LeadershipLost);
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_task(
        store: Arc<CoordinationStore>,
        registry: Arc<ConnectionRegistry>,
        heartbeat_interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Heartbeat task shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        if registry.has_any() {
                            match store.write_heartbeat().await {
                                Ok(()) => tracing::debug!(
                                    count = registry.len(),
                                    "Heartbeat: active clients"
                                ),
                                Err(e) => tracing::error!("Heartbeat failed: {}", e),
                            }
                        } else {
                            match store.clear_heartbeat().await {
                                Ok(()) => tracing::debug!("No clients, heartbeat key removed"),
                                Err(e) => tracing::error!("Heartbeat removal failed: {}", e),
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop all tasks, give up the lease if held and remove the heartbeat key.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        if self.is_leader.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.store.release_lease().await {
                tracing::warn!("Failed to release broadcast lease: {}", e);
            }
        }
        if let Err(e) = self.store.clear_heartbeat().await {
            tracing::warn!("Failed to remove heartbeat key: {}", e);
        }

        tracing::debug!(instance_id = self.store.instance_id(), "Cluster broadcaster stopped");
    }
}

/// One pass of the leadership loop.
///
/// Errors leave the leader flag untouched; the caller resets it.
async fn run_leadership_cycle(
    store: &CoordinationStore,
    is_leader: &AtomicBool,
) -> Result<LeaderCycle, Error> {
    if !is_leader.load(Ordering::Acquire) {
        if !store.try_acquire_lease().await? {
            tracing::debug!(instance_id = store.instance_id(), "Not a leader");
            return Ok(LeaderCycle::Follower);
        }
        is_leader.store(true, Ordering::Release);
        tracing::info!(instance_id = store.instance_id(), "Acquired broadcast lease, now leader");
    } else if !store.renew_lease().await? {
        is_leader.store(false, Ordering::Release);
        tracing::warn!(instance_id = store.instance_id(), "Broadcast lease lapsed before renewal");
        return Ok(LeaderCycle::LeaseLost);
    }

    let active = store.active_heartbeats().await?;
    if active.is_empty() {
        tracing::info!("No active clients, skipping broadcast");
        return Ok(LeaderCycle::Skipped);
    }

    store.publish(SCHEDULED_BROADCAST).await?;
    tracing::info!(active_workers = active.len(), "Published scheduled broadcast");
    Ok(LeaderCycle::Published {
        active_workers: active.len(),
    })
}

/// Forward one relayed message to every local connection not marked as
/// recently notified, then forget all marks.
pub(crate) fn relay(
    registry: &ConnectionRegistry,
    recently_notified: &DashSet<ConnectionId>,
    payload: &str,
) -> RelayStats {
    let mut stats = RelayStats::default();

    for (conn, _) in registry.all() {
        if recently_notified.contains(&conn.id()) {
            tracing::debug!(conn_id = %conn.id(), "Skipping recently notified client");
            stats.skipped += 1;
            continue;
        }
        if registry.deliver(&conn, payload) {
            stats.delivered += 1;
        } else {
            stats.dropped += 1;
        }
    }

    recently_notified.clear();
    stats
}
