//! End-to-end tests over loopback TCP
//!
//! Every test except the fixed-port scenario listens on an OS-assigned port so
//! the suite can run in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sockmux_runtime::{
    Endpoint, EventKind, EventReceiver, OperationKind, Role, Session, SessionConfig, SessionEvent,
    SocketState, SockmuxError, TextEncoding,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn next_of(rx: &mut EventReceiver, kind: EventKind) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} event within {:?}", kind, WAIT))
}

/// Assert that no event of `kind` arrives for a short while
async fn assert_quiet(rx: &mut EventReceiver, kind: EventKind) {
    let deadline = Instant::now() + QUIET;
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(Instant::now()), rx.recv()).await {
        assert_ne!(event.kind(), kind, "unexpected {:?}", event);
    }
}

fn received_bytes(event: SessionEvent) -> Vec<u8> {
    match event {
        SessionEvent::Received(e) => e.bytes,
        other => panic!("expected Received, got {:?}", other),
    }
}

async fn start_server() -> (Session, EventReceiver, u16) {
    let builder = Session::builder(SessionConfig::testing());
    let rx = builder.subscribe();
    let server = builder.listen(0).await.expect("listen");
    let port = server.local_addr().expect("bound address").port();
    (server, rx, port)
}

async fn connect_client(port: u16) -> (Session, EventReceiver) {
    let builder = Session::builder(SessionConfig::testing());
    let rx = builder.subscribe();
    let client = builder.connect("127.0.0.1", port.into()).await.expect("connect");
    (client, rx)
}

/// Connect a client and wait until the server has registered it
async fn connect_accepted(port: u16, server_rx: &mut EventReceiver) -> (Session, EventReceiver, Endpoint) {
    let (client, rx) = connect_client(port).await;
    let accepted = next_of(server_rx, EventKind::Accepted).await;
    let endpoint = Endpoint::from(client.local_addr().expect("client address"));
    assert_eq!(accepted.endpoint(), endpoint);
    (client, rx, endpoint)
}

// ----------------------------------------------------------------------------
// Construction
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_without_listener_fails_fast() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let connected = Arc::new(AtomicUsize::new(0));
    let counter = connected.clone();
    let builder = Session::builder(SessionConfig::testing());
    let mut rx = builder.subscribe();

    let started = Instant::now();
    let result = builder
        .on_connected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect("127.0.0.1", port.into())
        .await;

    assert!(matches!(result, Err(SockmuxError::ConnectFailed { .. })));
    assert!(started.elapsed() < SessionConfig::testing().timeout);

    // The failed session is torn down, so the stream ends without Connected.
    while let Some(event) = timeout(WAIT, rx.recv()).await.unwrap() {
        assert_ne!(event.kind(), EventKind::Connected);
    }
    assert_eq!(connected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validation_errors_precede_io() {
    let config = SessionConfig::testing;

    let err = Session::connect("not an address", 80, config()).await.unwrap_err();
    assert!(matches!(err, SockmuxError::InvalidAddress { .. }));
    assert!(err.is_validation());

    let err = Session::connect("127.0.0.1", 70_000, config()).await.unwrap_err();
    assert!(matches!(err, SockmuxError::PortOutOfRange { port: 70_000 }));

    let err = Session::connect("127.0.0.1", 0, config()).await.unwrap_err();
    assert!(matches!(err, SockmuxError::PortOutOfRange { port: 0 }));

    let err = Session::listen(65_536, config()).await.unwrap_err();
    assert!(err.is_validation());

    let err = Session::listen(0, config().with_read_buffer_size(0)).await.unwrap_err();
    assert!(matches!(err, SockmuxError::InvalidConfiguration { .. }));
}

#[tokio::test]
async fn test_listen_on_busy_port_fails() {
    let (_server, _rx, port) = start_server().await;
    let err = Session::listen(port.into(), SessionConfig::testing()).await.unwrap_err();
    assert!(matches!(err, SockmuxError::BindFailed { .. }));
}

#[tokio::test]
async fn test_session_properties() {
    let server = Session::listen_with_timeout(0, 1234).await.unwrap();
    assert_eq!(server.role(), Role::Server);
    assert_eq!(server.timeout(), Duration::from_millis(1234));
    assert_eq!(server.state(), SocketState::Accepting);
    assert!(server.remotes().is_empty());

    server.set_timeout(Duration::from_millis(50));
    assert_eq!(server.timeout(), Duration::from_millis(50));

    let port = server.local_addr().unwrap().port();
    let client = Session::connect_with_timeout("127.0.0.1", port.into(), 2000).await.unwrap();
    assert_eq!(client.role(), Role::Client);
    assert_eq!(client.state(), SocketState::Open);
    assert_eq!(client.timeout(), Duration::from_millis(2000));
}

// ----------------------------------------------------------------------------
// Data Delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_small_payload_arrives_as_one_event() {
    let (server, mut server_rx, port) = start_server().await;
    let (client, mut client_rx, endpoint) = connect_accepted(port, &mut server_rx).await;

    let connected = next_of(&mut client_rx, EventKind::Connected).await;
    assert_eq!(client.remotes(), vec![connected.endpoint()]);
    assert_eq!(server.remotes(), vec![endpoint]);

    client.send(b"hello!", None).await.unwrap();
    assert_eq!(next_of(&mut client_rx, EventKind::Sent).await.endpoint(), connected.endpoint());

    let received = next_of(&mut server_rx, EventKind::Received).await;
    assert_eq!(received.endpoint(), endpoint);
    assert_eq!(received_bytes(received), b"hello!");
    assert_quiet(&mut server_rx, EventKind::Received).await;
}

#[tokio::test]
async fn test_large_payload_is_split_by_read_buffer() {
    let (_server, mut server_rx, port) = start_server().await;
    let (client, _client_rx, _) = connect_accepted(port, &mut server_rx).await;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client.send(&payload, None).await.unwrap();

    let mut assembled = Vec::new();
    let mut reads = 0;
    while assembled.len() < payload.len() {
        let chunk = received_bytes(next_of(&mut server_rx, EventKind::Received).await);
        assert!(!chunk.is_empty());
        assert!(chunk.len() <= 1024, "read of {} bytes exceeds buffer", chunk.len());
        assembled.extend_from_slice(&chunk);
        reads += 1;
    }

    assert_eq!(assembled, payload);
    assert!(reads >= payload.len().div_ceil(1024));
}

#[tokio::test]
async fn test_text_encodings() {
    let (_server, mut server_rx, port) = start_server().await;
    let (client, _client_rx, _) = connect_accepted(port, &mut server_rx).await;

    client.send_text("日本語ΠΩЙ", None, None).await.unwrap();
    let mut text = Vec::new();
    while text.len() < "日本語ΠΩЙ".len() {
        text.extend(received_bytes(next_of(&mut server_rx, EventKind::Received).await));
    }
    assert_eq!(String::from_utf8(text).unwrap(), "日本語ΠΩЙ");

    client.send_text("é", Some(TextEncoding::Latin1), None).await.unwrap();
    assert_eq!(received_bytes(next_of(&mut server_rx, EventKind::Received).await), vec![0xE9]);
}

#[tokio::test]
async fn test_empty_payload_is_noop() {
    let (_server, mut server_rx, port) = start_server().await;
    let (client, mut client_rx, _) = connect_accepted(port, &mut server_rx).await;

    client.send(&[], None).await.unwrap();
    assert_quiet(&mut client_rx, EventKind::Sent).await;
}

// ----------------------------------------------------------------------------
// Server Sends
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_broadcast_reaches_every_registered_client() {
    let (server, mut server_rx, port) = start_server().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_accepted(port, &mut server_rx).await);
    }
    assert_eq!(server.remotes().len(), 3);

    let sent = Arc::new(AtomicUsize::new(0));
    let counter = sent.clone();
    server.on_sent(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    server.send(b"to all", None).await.unwrap();

    for (_client, rx, _) in clients.iter_mut() {
        assert_eq!(received_bytes(next_of(rx, EventKind::Received).await), b"to all");
    }

    // A client accepted after the broadcast gets nothing.
    let (_late, mut late_rx, _) = connect_accepted(port, &mut server_rx).await;
    assert_quiet(&mut late_rx, EventKind::Received).await;

    timeout(WAIT, async {
        while sent.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("one Sent per broadcast target");
}

#[tokio::test]
async fn test_unicast_and_missing_target() {
    let (server, mut server_rx, port) = start_server().await;
    let (_a, mut a_rx, a) = connect_accepted(port, &mut server_rx).await;
    let (_b, mut b_rx, _) = connect_accepted(port, &mut server_rx).await;

    server.send(b"only a", Some(a)).await.unwrap();
    assert_eq!(received_bytes(next_of(&mut a_rx, EventKind::Received).await), b"only a");
    assert_quiet(&mut b_rx, EventKind::Received).await;

    let stranger: Endpoint = "127.0.0.1:1".parse().unwrap();
    let err = server.send(b"nobody", Some(stranger)).await.unwrap_err();
    assert!(matches!(err, SockmuxError::TargetNotFound { endpoint } if endpoint == stranger));
    assert_quiet(&mut a_rx, EventKind::Received).await;
}

#[tokio::test]
async fn test_broadcast_without_peers_fails() {
    let (server, _rx, _port) = start_server().await;
    let err = server.send(b"anyone?", None).await.unwrap_err();
    assert!(matches!(err, SockmuxError::NoConnectedPeers));
}

// ----------------------------------------------------------------------------
// Disconnection and Disposal
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_client_close_disconnects_exactly_once() {
    let (server, mut server_rx, port) = start_server().await;
    let (client, _client_rx, endpoint) = connect_accepted(port, &mut server_rx).await;
    assert_eq!(server.remotes(), vec![endpoint]);

    client.close();

    let gone = next_of(&mut server_rx, EventKind::Disconnected).await;
    assert_eq!(gone.endpoint(), endpoint);
    assert!(!server.remotes().contains(&endpoint));
    assert_quiet(&mut server_rx, EventKind::Disconnected).await;
}

#[tokio::test]
async fn test_server_close_disconnects_client() {
    let (server, mut server_rx, port) = start_server().await;
    let (client, mut client_rx, _) = connect_accepted(port, &mut server_rx).await;

    drop(server);

    next_of(&mut client_rx, EventKind::Disconnected).await;
    assert!(client.remotes().is_empty());
    assert_eq!(client.state(), SocketState::Closed);

    let err = client.send(b"hello?", None).await.unwrap_err();
    assert!(matches!(err, SockmuxError::NotConnected));
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (server, mut server_rx, port) = start_server().await;
    let (_client, _client_rx, _) = connect_accepted(port, &mut server_rx).await;

    server.close();
    server.close();

    assert!(server.is_closed());
    assert_eq!(server.state(), SocketState::Closed);
    assert!(server.remotes().is_empty());
    assert!(matches!(server.send(b"x", None).await, Err(SockmuxError::Disposed)));

    // The event stream ends once the session is closed, without reporting
    // its own peers as disconnected.
    let drained = timeout(WAIT, async {
        while let Some(event) = server_rx.recv().await {
            assert_ne!(event.kind(), EventKind::Disconnected, "unexpected {:?}", event);
        }
    })
    .await;
    assert!(drained.is_ok());

    // The listener is gone once the aborted accept loop has been dropped.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = Session::connect("127.0.0.1", port.into(), SessionConfig::testing())
        .await
        .unwrap_err();
    assert!(matches!(err, SockmuxError::ConnectFailed { .. }));
}

// ----------------------------------------------------------------------------
// Subscribers and Time-outs
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_panicking_handler_does_not_stall_reads() {
    let (server, mut server_rx, port) = start_server().await;
    server.on_received(|_| panic!("handler failure"));

    let (client, _client_rx, _) = connect_accepted(port, &mut server_rx).await;

    client.send(b"first", None).await.unwrap();
    assert_eq!(received_bytes(next_of(&mut server_rx, EventKind::Received).await), b"first");

    client.send(b"second", None).await.unwrap();
    assert_eq!(received_bytes(next_of(&mut server_rx, EventKind::Received).await), b"second");
}

#[tokio::test]
async fn test_idle_read_timeout_is_advisory() {
    let config = SessionConfig::testing().with_read_timeout(Some(Duration::from_millis(100)));
    let builder = Session::builder(config);
    let mut server_rx = builder.subscribe();
    let server = builder.listen(0).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let (client, _client_rx, endpoint) = connect_accepted(port, &mut server_rx).await;

    match next_of(&mut server_rx, EventKind::TimedOut).await {
        SessionEvent::TimedOut(e) => {
            assert_eq!(e.endpoint, endpoint);
            assert_eq!(e.operation, OperationKind::Receive);
        }
        other => panic!("unexpected {:?}", other),
    }

    // The connection survives the idle deadline.
    assert_eq!(server.remotes(), vec![endpoint]);
    client.send(b"still here", None).await.unwrap();
    assert_eq!(
        received_bytes(next_of(&mut server_rx, EventKind::Received).await),
        b"still here"
    );
}

#[tokio::test]
async fn test_completed_send_never_times_out() {
    let (_server, mut server_rx, port) = start_server().await;
    let (client, mut client_rx, _) = connect_accepted(port, &mut server_rx).await;

    client.set_timeout(Duration::from_millis(100));
    client.send(b"in time", None).await.unwrap();
    next_of(&mut client_rx, EventKind::Sent).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_quiet(&mut client_rx, EventKind::TimedOut).await;
}

#[tokio::test]
async fn test_timed_out_send_still_delivers_whole_payload() {
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let builder = Session::builder(SessionConfig::testing().with_timeout_ms(300));
    let mut client_rx = builder.subscribe();
    let client = builder.connect("127.0.0.1", port.into()).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();
    let server = Endpoint::from(peer.local_addr().unwrap());

    // Far more than the socket buffers hold while the peer is not reading.
    let payload = vec![b'A'; 32 * 1024 * 1024];
    let err = client.send(&payload, None).await.unwrap_err();
    assert!(err.is_timeout(), "expected a time-out, got {:?}", err);
    match next_of(&mut client_rx, EventKind::TimedOut).await {
        SessionEvent::TimedOut(e) => assert_eq!(e.operation, OperationKind::Send),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.remotes(), vec![server]);

    client.set_timeout(Duration::from_secs(30));
    let reader = tokio::spawn(async move {
        let mut stream = vec![0u8; payload.len() + 3];
        peer.read_exact(&mut stream).await.map(|_| stream)
    });
    client.send(b"END", None).await.unwrap();

    let stream = timeout(Duration::from_secs(30), reader)
        .await
        .expect("peer read the whole stream")
        .unwrap()
        .unwrap();
    let (body, tail) = stream.split_at(stream.len() - 3);
    assert!(body.iter().all(|&b| b == b'A'));
    assert_eq!(tail, b"END");
}

// ----------------------------------------------------------------------------
// Scenario
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_fixed_port_conversation() {
    let builder = Session::builder(SessionConfig::testing());
    let mut server_rx = builder.subscribe();
    let server = builder.listen(41000).await.expect("port 41000 should be free");

    let builder = Session::builder(SessionConfig::testing());
    let mut client_rx = builder.subscribe();
    let client = builder.connect("127.0.0.1", 41000).await.unwrap();

    next_of(&mut server_rx, EventKind::Accepted).await;
    assert_eq!(server.remotes().len(), 1);
    let endpoint = server.remotes()[0];

    client.send_text("hello!", None, None).await.unwrap();
    let received = next_of(&mut server_rx, EventKind::Received).await;
    assert_eq!(received.endpoint(), endpoint);
    assert_eq!(received_bytes(received), b"hello!");
    assert_quiet(&mut server_rx, EventKind::Received).await;

    server.send_text("ack", None, Some(endpoint)).await.unwrap();
    assert_eq!(received_bytes(next_of(&mut client_rx, EventKind::Received).await), b"ack");
    assert_quiet(&mut client_rx, EventKind::Received).await;

    drop(client);

    assert_eq!(next_of(&mut server_rx, EventKind::Disconnected).await.endpoint(), endpoint);
    assert!(server.remotes().is_empty());
}
