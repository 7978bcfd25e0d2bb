//! Per-connection plumbing: registration, the receive loop and sends
//!
//! Client and server sessions share this code. A freshly opened stream is
//! split, its write half goes into the endpoint registry and its read half
//! into a dedicated receive loop task.

use std::sync::Arc;

use sockmux_core::{
    Endpoint, OperationKind, RemoteConnection, SessionEvent, SockmuxError, SockmuxResult,
};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::session::SessionShared;

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

/// Register an opened stream and start reading from it
///
/// `opened` builds the Connected or Accepted event, which is published before
/// the receive loop starts so it precedes every Received for the endpoint.
pub(crate) fn attach(
    shared: &Arc<SessionShared>,
    stream: TcpStream,
    endpoint: Endpoint,
    opened: fn(Endpoint) -> SessionEvent,
) -> bool {
    if shared.config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", endpoint, e);
        }
    }

    let (read_half, write_half) = stream.into_split();
    let connection = RemoteConnection::new(endpoint, write_half);

    if !shared.registry.add(endpoint, connection.clone()) {
        warn!("Dropping duplicate connection from {}", endpoint);
        return false;
    }
    // Close may have drained the registry just before the insert.
    if shared.is_disposed() {
        shared.registry.remove(&endpoint);
        return false;
    }

    shared.events.publish(opened(endpoint));

    let reader = tokio::spawn(receive_loop(shared.clone(), endpoint, read_half));
    connection.attach_reader(reader.abort_handle());
    true
}

// ----------------------------------------------------------------------------
// Receive Loop
// ----------------------------------------------------------------------------

async fn receive_loop(shared: Arc<SessionShared>, endpoint: Endpoint, mut reader: OwnedReadHalf) {
    let mut buffer = vec![0u8; shared.config.read_buffer_size];

    loop {
        let read = match shared.config.read_timeout {
            Some(idle) => {
                let outcome = shared
                    .scheduler
                    .track(endpoint, OperationKind::Receive, idle, async {
                        reader.read(&mut buffer).await.map_err(SockmuxError::from)
                    })
                    .await;
                match outcome {
                    // Advisory: the scheduler already published TimedOut.
                    Err(SockmuxError::Timeout(_)) => continue,
                    Err(SockmuxError::Io(e)) => Err(e),
                    Err(_) => return,
                    Ok(n) => Ok(n),
                }
            }
            None => reader.read(&mut buffer).await,
        };

        if shared.is_disposed() {
            return;
        }

        match read {
            Ok(0) => {
                debug!("{} closed the connection", endpoint);
                break;
            }
            Ok(n) => {
                debug!("Received {} bytes from {}", n, endpoint);
                shared
                    .events
                    .publish(SessionEvent::received(endpoint, buffer[..n].to_vec()));
            }
            Err(e) => {
                debug!("Read from {} failed: {}", endpoint, e);
                break;
            }
        }
    }

    disconnect(&shared, endpoint);
}

/// Remove a peer that stopped answering and report it once
fn disconnect(shared: &SessionShared, endpoint: Endpoint) {
    // Removal aborts this task at its next await, so nothing may await after it.
    if shared.registry.remove(&endpoint) {
        info!("{} disconnected", endpoint);
        shared.on_peer_lost();
        shared.events.publish(SessionEvent::disconnected(endpoint));
    }
}

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

/// Write one payload to one peer under the session's send deadline
///
/// The write runs in its own task and keeps going after the deadline, so a
/// time-out is reported without cutting the payload short on an open stream.
/// Later sends to the same peer queue behind it.
pub(crate) async fn deliver(
    shared: &SessionShared,
    connection: RemoteConnection,
    payload: Arc<[u8]>,
) -> SockmuxResult<()> {
    let endpoint = connection.endpoint();
    let len = payload.len();
    let write = tokio::spawn(async move { connection.write_all(&payload).await });

    let result = shared
        .scheduler
        .track(endpoint, OperationKind::Send, shared.timeout(), async {
            match write.await {
                Ok(written) => {
                    written.map_err(|source| SockmuxError::SendFailed { endpoint, source })
                }
                Err(_) => Err(SockmuxError::Disposed),
            }
        })
        .await;

    match &result {
        Ok(()) => {
            debug!("Sent {} bytes to {}", len, endpoint);
            shared.events.publish(SessionEvent::sent(endpoint));
        }
        Err(SockmuxError::Timeout(_)) => {
            debug!("Send to {} is still in flight past its deadline", endpoint)
        }
        Err(e) => warn!("Send to {} failed: {}", endpoint, e),
    }
    result
}
