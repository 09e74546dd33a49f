use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{BroadcastConfig, ConnectionRegistry};

/// Lifecycle of a worker process around a termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Terminated,
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection went away before the timeout.
    Drained,
    /// The timeout elapsed with connections still open.
    TimedOut { remaining: usize },
}

/// Waits, bounded by a timeout, for a process's connections to go away.
///
/// Performs no orderly close of its own: it only polls the registry and
/// then hands control to a terminate callback, which in production exits
/// the process without running the server's graceful shutdown (that would
/// close the sockets before they could drain).
pub struct DrainCoordinator {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl DrainCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, timeout: Duration) -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            registry,
            interval,
            timeout,
            phase_tx,
        }
    }

    pub fn from_config(config: &BroadcastConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self::new(registry, config.drain_interval, config.drain_timeout)
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    /// Enter `Draining` and poll the registry until it is empty or the
    /// timeout elapses. Returns at once if there are no connections.
    pub async fn drain(&self) -> DrainOutcome {
        self.phase_tx.send_replace(ShutdownPhase::Draining);
        tracing::info!(pid = std::process::id(), "Graceful shutdown initiated");

        let deadline = Instant::now() + self.timeout;
        while self.registry.has_any() {
            let now = Instant::now();
            if now >= deadline {
                let remaining = self.registry.len();
                tracing::info!(
                    pid = std::process::id(),
                    remaining,
                    "Drain timeout reached"
                );
                return DrainOutcome::TimedOut { remaining };
            }

            tracing::info!(
                pid = std::process::id(),
                count = self.registry.len(),
                "Waiting for connections to close"
            );
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }

        tracing::info!(pid = std::process::id(), "No active clients");
        DrainOutcome::Drained
    }

    /// Wait for the shutdown signal, drain, then call `terminate`.
    ///
    /// The signal arrives as a cancelled token rather than from inside an OS
    /// signal handler, so all of this runs as an ordinary task.
    pub async fn run<F>(self: Arc<Self>, signal: CancellationToken, terminate: F)
    where
        F: FnOnce(DrainOutcome),
    {
        signal.cancelled().await;
        let outcome = self.drain().await;
        self.phase_tx.send_replace(ShutdownPhase::Terminated);
        tracing::info!(pid = std::process::id(), ?outcome, "Shutting down");
        terminate(outcome);
    }
}
