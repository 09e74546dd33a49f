use std::sync::Arc;
use std::time::Duration;

use crate::{
    BroadcastConfig, BroadcastMode, ClusterBroadcaster, ConnectionId, ConnectionRegistry, Error,
    LocalBroadcaster,
};

/// The broadcaster a worker process runs, chosen once from the worker count.
///
/// Callers only use [`start`](Self::start) and
/// [`mark_recent`](Self::mark_recent), so the rest of the process does not
/// care which coordination mode is active.
pub enum Broadcaster {
    Local(LocalBroadcaster),
    Cluster(ClusterBroadcaster),
}

impl Broadcaster {
    /// Build the broadcaster matching `config.workers`.
    ///
    /// # Errors
    ///
    /// Returns an error if cluster mode is selected and the Redis URL is
    /// invalid. An unreachable Redis is not an error: the cluster loops keep
    /// retrying on their own cadence.
    pub fn select(
        config: &BroadcastConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, Error> {
        let broadcaster = match config.mode() {
            BroadcastMode::Single => Self::Local(LocalBroadcaster::from_config(config, registry)),
            BroadcastMode::Cluster => {
                Self::Cluster(ClusterBroadcaster::new(config, registry)?)
            }
        };
        tracing::info!(
            workers = config.workers,
            mode = %broadcaster.mode(),
            "Broadcast strategy selected"
        );
        Ok(broadcaster)
    }

    /// Launch the background work. Idempotent.
    pub fn start(&self) {
        match self {
            Self::Local(local) => local.start(),
            Self::Cluster(cluster) => cluster.start(),
        }
    }

    pub fn mark_recent(&self, id: ConnectionId) {
        match self {
            Self::Local(local) => local.mark_recent(id),
            Self::Cluster(cluster) => cluster.mark_recent(id),
        }
    }

    pub fn mode(&self) -> BroadcastMode {
        match self {
            Self::Local(_) => BroadcastMode::Single,
            Self::Cluster(_) => BroadcastMode::Cluster,
        }
    }

    pub fn is_leader(&self) -> Option<bool> {
        match self {
            Self::Local(_) => None,
            Self::Cluster(cluster) => Some(cluster.is_leader()),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Local(local) => local.shutdown().await,
            Self::Cluster(cluster) => cluster.shutdown().await,
        }
    }

    /// [`shutdown`](Self::shutdown), giving up after `limit`.
    ///
    /// Returns false if the limit elapsed first, e.g. because Redis stopped
    /// answering while the lease was being released.
    pub async fn shutdown_within(&self, limit: Duration) -> bool {
        let stopped = tokio::time::timeout(limit, self.shutdown()).await.is_ok();
        if !stopped {
            tracing::warn!(limit_ms = limit.as_millis() as u64, "Broadcaster did not stop in time");
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_worker_selects_local() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(10)));
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };

        let broadcaster = Broadcaster::select(&config, registry).unwrap();
        assert_eq!(broadcaster.mode(), BroadcastMode::Single);
        assert_eq!(broadcaster.is_leader(), None);
        assert!(matches!(broadcaster, Broadcaster::Local(_)));

        broadcaster.start();
        broadcaster.start();
        broadcaster.mark_recent(ConnectionId::new());
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_workers_treated_as_single() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(10)));
        let config = BroadcastConfig {
            workers: 0,
            ..Default::default()
        };
        let broadcaster = Broadcaster::select(&config, registry).unwrap();
        assert_eq!(broadcaster.mode(), BroadcastMode::Single);
    }

    #[tokio::test]
    async fn test_cluster_mode_rejects_invalid_url() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(10)));
        let config = BroadcastConfig {
            workers: 2,
            redis_url: "not-a-redis-url".into(),
            ..Default::default()
        };
        let result = Broadcaster::select(&config, registry);
        assert!(matches!(result, Err(Error::Redis(_))));
    }

    #[tokio::test]
    async fn test_cluster_mode_starts_without_reachable_redis() {
        // Nothing listens on the discard port
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(10)));
        let config = BroadcastConfig {
            workers: 2,
            redis_url: "redis://127.0.0.1:9".into(),
            ..Default::default()
        };

        let broadcaster = Broadcaster::select(&config, registry).unwrap();
        assert_eq!(broadcaster.mode(), BroadcastMode::Cluster);
        assert_eq!(broadcaster.is_leader(), Some(false));

        broadcaster.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broadcaster.is_leader(), Some(false));
        assert!(broadcaster.shutdown_within(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_shutdown_within_bounds_unresponsive_redis() {
        // Accepts TCP connections into the backlog but never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(10)));
        let config = BroadcastConfig {
            workers: 2,
            redis_url: format!("redis://{}", silent.local_addr().unwrap()),
            ..Default::default()
        };
        let broadcaster = Broadcaster::select(&config, registry).unwrap();

        let started = std::time::Instant::now();
        let stopped = broadcaster.shutdown_within(Duration::from_millis(300)).await;

        assert!(!stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
