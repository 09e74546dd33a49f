// ABOUTME: beacon binary: one WebSocket worker, or a supervisor over N workers sharing a port
// ABOUTME: Workers pick a broadcast strategy from WORKERS and drain connections on SIGINT/SIGTERM

mod signals;
mod supervisor;

use beacon_api::server::{bind_reuse_port, serve};
use beacon_api::state::BeaconState;
use cluster_broadcast::{BroadcastConfig, Broadcaster, ConnectionRegistry, DrainCoordinator};
use dotenv::dotenv;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::signals::wait_for_shutdown_signal;
use crate::supervisor::Supervisor;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
// Lease release is a courtesy; an unreleased lease expires on its own
const BROADCASTER_STOP_TIMEOUT: Duration = Duration::from_millis(500);

fn init_tracing() {
    // JSON in production for log aggregation
    let is_production = env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Listen address from `HOST` and `PORT`.
fn listen_addr() -> Result<SocketAddr, String> {
    let host = env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = match env::var("PORT") {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("PORT must be a port number, got {:?}", raw))?,
        Err(_) => DEFAULT_PORT,
    };
    format!("{}:{}", host, port)
        .parse()
        .map_err(|_| format!("HOST must be an IP address, got {:?}", host))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();

    let config = BroadcastConfig::from_env();
    let addr = match config.validate().map_err(|e| e.to_string()).and(listen_addr()) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("\nConfiguration error:\n{}\n", e);
            std::process::exit(1);
        }
    };

    // Each worker is its own process, so one thread per worker is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match supervisor::worker_index() {
        None if config.workers > 1 => runtime.block_on(run_supervisor(config.workers)),
        index => runtime.block_on(run_worker(config, addr, index)),
    }
}

async fn run_supervisor(workers: usize) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(workers, "Starting supervisor");

    let statuses = Supervisor::for_current_exe(workers)?
        .run(wait_for_shutdown_signal())
        .await?;

    let failed = statuses.iter().filter(|s| !s.success()).count();
    tracing::info!(workers, failed, "All workers exited");
    Ok(())
}

async fn run_worker(
    config: BroadcastConfig,
    addr: SocketAddr,
    index: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pid = std::process::id();
    tracing::info!(
        pid,
        worker_index = ?index,
        mode = %config.mode(),
        "Starting worker"
    );

    let registry = Arc::new(ConnectionRegistry::new(config.broadcast_period));

    // Fails only on an invalid Redis URL; Redis itself is dialled lazily
    let broadcaster = Arc::new(Broadcaster::select(&config, registry.clone())?);
    broadcaster.start();
    tracing::info!(pid, mode = %broadcaster.mode(), "✔︎ Broadcaster started");

    let shutdown = CancellationToken::new();
    let drain = Arc::new(DrainCoordinator::from_config(&config, registry.clone()));
    let drained_broadcaster = broadcaster.clone();
    let drain_signal = shutdown.clone();
    tokio::spawn(async move {
        drain.run(drain_signal, |_outcome| {}).await;
        // Hands the lease over early instead of letting it expire
        drained_broadcaster
            .shutdown_within(BROADCASTER_STOP_TIMEOUT)
            .await;
        // No graceful server shutdown; remaining sockets die with the process
        std::process::exit(0);
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let listener = bind_reuse_port(addr)?;
    let state = BeaconState::new(registry, broadcaster.clone());
    tracing::info!(pid, %addr, "✔︎ Worker ready");

    if let Err(e) = serve(listener, state).await {
        tracing::error!(pid, "Server error: {}", e);
        broadcaster.shutdown_within(BROADCASTER_STOP_TIMEOUT).await;
        return Err(e.into());
    }
    Ok(())
}
