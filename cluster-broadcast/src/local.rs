use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{BroadcastConfig, ConnectionId, ConnectionRegistry, SCHEDULED_BROADCAST};

/// Broadcaster for a process that owns every connection.
///
/// Scans the registry on a short cadence and sends the scheduled broadcast
/// to each connection whose `next_due` has passed, then pushes it one
/// broadcast period into the future.
pub struct LocalBroadcaster {
    registry: Arc<ConnectionRegistry>,
    scan_interval: Duration,
    broadcast_period: Duration,
    started: AtomicBool,
    cancel_token: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scan_interval: Duration,
        broadcast_period: Duration,
    ) -> Self {
        Self {
            registry,
            scan_interval,
            broadcast_period,
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            task_handle: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BroadcastConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self::new(registry, config.scan_interval, config.broadcast_period)
    }

    /// Launch the scan loop. Calling it again is a no-op.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let handle = Self::spawn_scan_task(
            self.registry.clone(),
            self.scan_interval,
            self.broadcast_period,
            self.cancel_token.clone(),
        );
        *self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            scan_ms = self.scan_interval.as_millis() as u64,
            period_secs = self.broadcast_period.as_secs(),
            "Local broadcaster started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel_token.is_cancelled()
    }

    /// Immediate replies need no bookkeeping here: each connection's own
    /// schedule already decides when it next hears from us.
    pub fn mark_recent(&self, id: ConnectionId) {
        tracing::trace!(conn_id = %id, "mark_recent ignored in single-process mode");
    }

    fn spawn_scan_task(
        registry: Arc<ConnectionRegistry>,
        scan_interval: Duration,
        broadcast_period: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Local broadcaster shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        scan_due(&registry, broadcast_period, Instant::now());
                    }
                }
            }
        })
    }

    /// Stop the scan loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Send the scheduled broadcast to every connection due at `now`.
///
/// Returns how many connections received it.
pub(crate) fn scan_due(
    registry: &ConnectionRegistry,
    broadcast_period: Duration,
    now: Instant,
) -> usize {
    let mut sent = 0;
    for (conn, next_due) in registry.all() {
        if now < next_due {
            continue;
        }
        if registry.deliver(&conn, SCHEDULED_BROADCAST) {
            registry.reschedule(conn.id(), now + broadcast_period);
            tracing::info!(conn_id = %conn.id(), "Sent scheduled broadcast");
            sent += 1;
        }
    }
    sent
}
