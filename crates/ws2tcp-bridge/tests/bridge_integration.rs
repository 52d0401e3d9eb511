//! End-to-end tests for the bridge over real sockets.
//!
//! # Purpose
//!
//! These tests wire the public pieces together the way `main` does: a
//! [`TcpTarget`] connected to a local upstream listener, a [`WsServer`]
//! bound to an ephemeral port, and real WebSocket clients from
//! `tokio-tungstenite`.  They verify:
//!
//! - Bytes flow both ways, verbatim without a subprotocol and
//!   base64-wrapped with the `base64` subprotocol.
//! - Only one client holds a session at a time; a second one gets a policy
//!   close, and the slot frees up once the first client leaves.
//! - Requests for any other path fail the upgrade.
//! - Losing the upstream closes the active client and resolves the driver
//!   handle with a clean-exit error.
//!
//! ```text
//! WS client ──ws://127.0.0.1:<eph>/ebu-tt/publish──► WsServer
//!                                                     │
//!                                               BridgeSession
//!                                                     │
//!                                       TcpTarget ──► upstream (127.0.0.1:<eph>)
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::Span;

use ws2tcp_bridge::application::SessionRegistry;
use ws2tcp_bridge::infrastructure::ws_server::SESSION_EXISTS_REASON;
use ws2tcp_bridge::infrastructure::{FatalError, ServerContext, TcpTarget, WsServer};

const PATH: &str = "/ebu-tt/publish";
const WAIT: Duration = Duration::from_secs(5);
/// Upper bound for teardown that needs no timeout to fire.
const PROMPT: Duration = Duration::from_secs(1);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Fixture ───────────────────────────────────────────────────────────────────

/// A running bridge plus the upstream end of its TCP connection.
struct Bridge {
    url: String,
    registry: SessionRegistry,
    target: TcpTarget,
    driver: JoinHandle<FatalError>,
    upstream: TcpStream,
}

async fn start_bridge() -> Bridge {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let (target, driver) = TcpTarget::connect(upstream_addr, Span::none());
    let (upstream, _) = timeout(WAIT, upstream_listener.accept())
        .await
        .expect("bridge never connected upstream")
        .unwrap();

    let registry = SessionRegistry::new();
    let server = WsServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        ServerContext {
            path: PATH.to_string(),
            target: target.clone(),
            registry: registry.clone(),
            tls: None,
            verbose: false,
        },
    )
    .await
    .unwrap();
    let url = format!("ws://{}{PATH}", server.local_addr().unwrap());
    tokio::spawn(server.run());

    Bridge {
        url,
        registry,
        target,
        driver,
        upstream,
    }
}

async fn connect(url: &str, subprotocol: Option<&str>) -> Client {
    let mut request = url.into_client_request().unwrap();
    if let Some(protocol) = subprotocol {
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(protocol).unwrap());
    }
    let (ws, _) = timeout(WAIT, connect_async(request))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    ws
}

/// Polls `condition` every 10 ms until it holds or [`WAIT`] elapses.
async fn eventually(mut condition: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition never became true");
}

async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

/// Connects a client and waits until it owns the session and is relaying
/// upstream data.
async fn connect_session(bridge: &Bridge, subprotocol: Option<&str>) -> Client {
    let client = connect(&bridge.url, subprotocol).await;
    eventually(|| bridge.registry.active().is_some() && bridge.target.has_subscriber()).await;
    client
}

async fn read_upstream(upstream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    within(upstream.read_exact(&mut buf)).await.unwrap();
    buf
}

// ── Relay ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_binary_session_relays_bytes_verbatim_both_ways() {
    // Arrange
    let mut bridge = start_bridge().await;
    let mut client = connect_session(&bridge, None).await;

    // Act: client → upstream
    client
        .send(Message::Binary(vec![0x01, 0x02, 0x03, 0x04]))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        read_upstream(&mut bridge.upstream, 4).await,
        vec![0x01, 0x02, 0x03, 0x04]
    );

    // Act: upstream → client
    bridge.upstream.write_all(&[0xff, 0x00]).await.unwrap();

    // Assert
    match within(client.next()).await {
        Some(Ok(Message::Binary(data))) => assert_eq!(data, vec![0xff, 0x00]),
        other => panic!("expected a binary message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_base64_session_encodes_and_decodes() {
    // Arrange
    let mut bridge = start_bridge().await;
    let mut client = connect_session(&bridge, Some("base64")).await;

    // Act: upstream sends raw bytes
    bridge.upstream.write_all(b"ABC").await.unwrap();

    // Assert: the client sees them as base64 text
    match within(client.next()).await {
        Some(Ok(Message::Text(text))) => assert_eq!(text, "QUJD"),
        other => panic!("expected a text message, got {other:?}"),
    }

    // Act: the client sends base64 text
    client.send(Message::Text("QUJD".to_string())).await.unwrap();

    // Assert: the upstream receives the decoded bytes
    assert_eq!(read_upstream(&mut bridge.upstream, 3).await, b"ABC");
}

#[tokio::test]
async fn test_malformed_base64_is_dropped_and_session_survives() {
    let mut bridge = start_bridge().await;
    let mut client = connect_session(&bridge, Some("base64")).await;

    client.send(Message::Text("!!not base64!!".to_string())).await.unwrap();
    client.send(Message::Text("eHl6".to_string())).await.unwrap();

    // Only the valid message reaches the upstream.
    assert_eq!(read_upstream(&mut bridge.upstream, 3).await, b"xyz");
    assert!(bridge.registry.active().is_some());
}

// ── Admission ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_client_is_rejected_with_policy_close() {
    // Arrange: the first client owns the session
    let bridge = start_bridge().await;
    let _first = connect_session(&bridge, None).await;
    let owner = bridge.registry.active().unwrap();

    // Act
    let mut second = connect(&bridge.url, None).await;

    // Assert: the second client is closed with the policy code
    match within(second.next()).await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason, SESSION_EXISTS_REASON);
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
    assert_eq!(bridge.registry.active().map(|s| s.id), Some(owner.id));
}

#[tokio::test]
async fn test_slot_is_released_when_client_leaves() {
    // Arrange
    let mut bridge = start_bridge().await;
    let mut first = connect_session(&bridge, None).await;

    // Act: the first client closes and finishes the handshake
    first.close(None).await.unwrap();
    while let Some(Ok(_)) = within(first.next()).await {}
    within(bridge.registry.wait_until_empty()).await;

    // Assert: a new client is admitted and relays
    let mut second = connect_session(&bridge, None).await;
    second.send(Message::Binary(b"again".to_vec())).await.unwrap();
    assert_eq!(read_upstream(&mut bridge.upstream, 5).await, b"again");
}

#[tokio::test]
async fn test_wrong_path_fails_the_upgrade() {
    let bridge = start_bridge().await;
    let url = bridge.url.replace(PATH, "/other/publish");

    let result = within(connect_async(url)).await;

    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        Err(e) => panic!("expected an HTTP refusal, got {e}"),
        Ok(_) => panic!("upgrade on the wrong path must fail"),
    }
    assert!(bridge.registry.is_empty());
}

// ── Upstream loss ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upstream_close_closes_client_and_ends_driver() {
    // Arrange
    let bridge = start_bridge().await;
    let mut client = connect_session(&bridge, None).await;

    // Act: the upstream goes away
    drop(bridge.upstream);

    // Assert: the client is told to go away
    match within(client.next()).await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected a close frame, got {other:?}"),
    }
    // Keep polling so the client's close reply is flushed to the bridge.
    while let Some(Ok(_)) = within(client.next()).await {}

    // Assert: the driver reports a clean end
    let fatal = within(bridge.driver).await.unwrap();
    assert!(matches!(fatal, FatalError::Ended { .. }), "got {fatal:?}");
    assert_eq!(fatal.exit_code(), 0);

    // Assert: the completed close handshake frees the slot well inside the
    // supervisor's shutdown grace, not when the close timeout expires.
    let freed = timeout(PROMPT, bridge.registry.wait_until_empty()).await;
    assert!(freed.is_ok(), "session slot still occupied after {PROMPT:?}");
}

#[tokio::test]
async fn test_unreachable_upstream_resolves_driver_with_refused() {
    // Arrange: reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // Act
    let (_target, driver) = TcpTarget::connect(addr, Span::none());
    let fatal = within(driver).await.unwrap();

    // Assert
    assert!(matches!(fatal, FatalError::Refused { .. }), "got {fatal:?}");
    assert_eq!(fatal.exit_code(), 1);
    assert_eq!(
        fatal.to_string(),
        format!("failed to connect to tcp socket on {addr}")
    );
}
