//! Listening socket setup and the accept loop

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use sockmux_core::{Endpoint, SessionConfig, SessionEvent, SockmuxError, SockmuxResult};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::connection;
use crate::session::SessionShared;

/// Pause after a failed accept so resource exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// Binding
// ----------------------------------------------------------------------------

/// Bind the server socket
///
/// Without an explicit bind address this tries a dual-stack `[::]` socket and
/// falls back to `0.0.0.0` on hosts without IPv6.
pub(crate) fn bind(port: u16, config: &SessionConfig) -> SockmuxResult<TcpListener> {
    let bind_failed = |source| SockmuxError::BindFailed { port, source };

    if let Some(ip) = config.bind_address {
        let dual_stack = ip == IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        return bind_socket(SocketAddr::new(ip, port), config.listen_backlog, dual_stack)
            .map_err(bind_failed);
    }

    let any_v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match bind_socket(any_v6, config.listen_backlog, true) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!("Dual-stack bind on port {} failed ({}), using IPv4", port, e);
            let any_v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            bind_socket(any_v4, config.listen_backlog, false).map_err(bind_failed)
        }
    }
}

fn bind_socket(addr: SocketAddr, backlog: u32, dual_stack: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    TcpListener::from_std(socket.into())
}

// ----------------------------------------------------------------------------
// Accept Loop
// ----------------------------------------------------------------------------

/// Accept connections until the session is closed
///
/// Each accepted stream is registered and handed its own receive loop before
/// the next accept is issued.
pub(crate) async fn accept_loop(shared: Arc<SessionShared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if shared.is_disposed() {
                    break;
                }
                let endpoint = Endpoint::from(addr);
                if connection::attach(&shared, stream, endpoint, SessionEvent::accepted) {
                    info!("Accepted connection from {}", endpoint);
                }
            }
            Err(e) => {
                if shared.is_disposed() {
                    break;
                }
                error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_loopback_ephemeral() {
        let config = SessionConfig::testing();
        let listener = bind(0, &config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_port() {
        let config = SessionConfig::testing();
        let first = bind(0, &config).unwrap();
        let port = first.local_addr().unwrap().port();

        match bind(port, &config) {
            Err(SockmuxError::BindFailed { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected bind failure, got {:?}", other.map(|l| l.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_default_bind_accepts_ipv4_clients() {
        let config = SessionConfig::default();
        let listener = bind(0, &config).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(Endpoint::from(peer).addr(), client.local_addr().unwrap());
    }
}
