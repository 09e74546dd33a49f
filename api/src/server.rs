use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::api::http::beacon_routes;
use crate::error::ApiResult;
use crate::state::BeaconState;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener that other worker processes can bind to as well.
///
/// On unix `SO_REUSEPORT` lets every worker own a socket on the same port,
/// with the kernel spreading new connections across them.
pub fn bind_reuse_port(addr: SocketAddr) -> ApiResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok(listener)
}

/// Serve the worker's router until the listener fails.
///
/// There is no graceful-shutdown hook: termination goes through the drain
/// coordinator, which exits the process once connections are gone.
pub async fn serve(listener: TcpListener, state: BeaconState) -> ApiResult<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, pid = std::process::id(), "Listening");

    axum::serve(listener, beacon_routes(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_listeners_share_a_port() {
        let first = bind_reuse_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        #[cfg(unix)]
        {
            let second = bind_reuse_port(addr).unwrap();
            assert_eq!(second.local_addr().unwrap().port(), addr.port());
        }
    }
}
