/// Termination request delivered to a beacon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    #[cfg(unix)]
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            ShutdownSignal::Interrupt => libc::SIGINT,
            ShutdownSignal::Terminate => libc::SIGTERM,
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM.
///
/// Handlers are installed when this is first polled, so callers spawn it
/// early instead of awaiting it at the end of startup.
pub async fn wait_for_shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(pid = std::process::id(), "Received Ctrl+C, initiating shutdown");
            ShutdownSignal::Interrupt
        }
        _ = terminate => {
            tracing::info!(pid = std::process::id(), "Received SIGTERM, initiating shutdown");
            ShutdownSignal::Terminate
        }
    }
}
