//! WebSocket listener: accept loop, handshake, and admission.
//!
//! For every inbound TCP connection this module:
//!
//! 1. Terminates TLS when the listener was configured with a certificate.
//! 2. Performs the WebSocket upgrade, refusing any path other than the
//!    configured one and selecting the first subprotocol the client offers.
//! 3. Asks the [`SessionRegistry`] for the slot.  A rejected connection gets
//!    a close frame and is dropped without ever touching the upstream; an
//!    admitted one becomes a [`BridgeSession`] bound to the shared
//!    [`TcpTarget`].
//! 4. Releases the slot when the session ends.
//!
//! Each connection runs in its own Tokio task, so a slow handshake never
//! blocks the accept loop.  Accept and handshake failures are logged and the
//! loop carries on.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, info_span, warn};

use crate::application::{BridgeSession, SessionRegistry};
use crate::domain::FrameEncoding;
use crate::infrastructure::tcp_target::TcpTarget;

/// How long a rejected client gets to answer our close frame.
const REJECT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Close reason sent to a client turned away by the single-session policy.
pub const SESSION_EXISTS_REASON: &str = "a websocket session already exists";

// ── Client stream ─────────────────────────────────────────────────────────────

/// Byte stream to a WebSocket client, plain or TLS.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

/// A client connection after optional TLS termination.
pub type ClientStream = Box<dyn ClientIo>;

// ── Server ────────────────────────────────────────────────────────────────────

/// Everything a connection handler needs, shared by all connection tasks.
pub struct ServerContext {
    /// Only requests for this path are upgraded.
    pub path: String,
    /// The shared upstream.
    pub target: TcpTarget,
    /// Single-session admission.
    pub registry: SessionRegistry,
    /// Present when the listener serves `wss://`.
    pub tls: Option<TlsAcceptor>,
    /// Log payload previews.
    pub verbose: bool,
}

/// A bound WebSocket listener.
pub struct WsServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl WsServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (port in use,
    /// missing permission, ...).
    pub async fn bind(addr: SocketAddr, ctx: ServerContext) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    /// The address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the future is dropped.
    pub async fn run(self) {
        let scheme = if self.ctx.tls.is_some() { "wss" } else { "ws" };
        match self.listener.local_addr() {
            Ok(addr) => info!("listening on {scheme}://{addr}{}", self.ctx.path),
            Err(e) => warn!("listening (local address unknown: {e})"),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("tcp connection from {peer}");
                    // Each task gets its own reference to the shared context;
                    // `Arc::clone` only bumps a counter.
                    let ctx = Arc::clone(&self.ctx);
                    // The handshake may stall on a slow client, so it runs in
                    // its own task and the loop goes straight back to accept.
                    tokio::spawn(handle_connection(stream, peer, ctx));
                }
                Err(e) => {
                    // Transient (e.g. out of file descriptors); keep serving.
                    error!("accept error: {e}");
                }
            }
        }
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(raw: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
    // ── Step 1: optional TLS ──────────────────────────────────────────────────
    //
    // Both arms are boxed into the same stream type so the rest of the
    // handler does not care whether the client speaks ws:// or wss://.
    let io: ClientStream = match &ctx.tls {
        Some(acceptor) => match acceptor.accept(raw).await {
            Ok(tls) => Box::new(tls),
            Err(e) => {
                warn!("TLS handshake with {peer} failed: {e}");
                return;
            }
        },
        None => Box::new(raw),
    };

    // ── Step 2: WebSocket upgrade ─────────────────────────────────────────────
    //
    // The callback sees the raw HTTP request; it refuses foreign paths and
    // records the subprotocol it picked so the encoding can be chosen below.
    let mut negotiated: Option<String> = None;
    let handshake = accept_hdr_async(io, |request: &Request, response: Response| {
        negotiate(request, response, &ctx.path, &mut negotiated)
    })
    .await;
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };

    // ── Step 3: admission ─────────────────────────────────────────────────────
    //
    // Only checked after the upgrade so a rejected client receives a proper
    // close frame instead of a reset connection.
    let handle = match ctx.registry.try_admit(peer) {
        Ok(handle) => handle,
        Err(rejected) => {
            warn!("{rejected}; closing connection from {peer}");
            reject(ws).await;
            return;
        }
    };

    // ── Step 4: relay ─────────────────────────────────────────────────────────
    //
    // The encoding is fixed here, once, for the whole session.
    let encoding = FrameEncoding::from_subprotocol(negotiated.as_deref());
    info!(
        "new session {} from {} (subprotocol: {}, encoding: {encoding})",
        handle.id(),
        handle.peer(),
        negotiated.as_deref().unwrap_or("none"),
    );

    let span = info_span!(
        "session",
        component = "session",
        id = %handle.id(),
        peer = %handle.peer()
    );
    // `run` only returns once the session has let go of the upstream
    // subscription, so the slot is never freed while relay is still possible.
    let end = BridgeSession::new(ws, ctx.target.clone(), encoding, ctx.verbose, span)
        .run()
        .await;

    info!("session {} from {} ended: {end:?}", handle.id(), handle.peer());
    ctx.registry.release(handle);
}

/// Handshake callback: enforces the path and picks the subprotocol.
fn negotiate(
    request: &Request,
    mut response: Response,
    path: &str,
    negotiated: &mut Option<String>,
) -> Result<Response, ErrorResponse> {
    let requested = request.uri().path();
    if requested != path {
        let mut refusal = ErrorResponse::new(Some(format!("unknown path {requested}")));
        *refusal.status_mut() = StatusCode::BAD_REQUEST;
        return Err(refusal);
    }

    if let Some(protocol) = first_subprotocol(request.headers()) {
        if let Ok(value) = HeaderValue::from_str(&protocol) {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            *negotiated = Some(protocol);
        }
    }
    Ok(response)
}

/// The first non-empty entry of `Sec-WebSocket-Protocol`, across all
/// occurrences of the header.
fn first_subprotocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find(|protocol| !protocol.is_empty())
        .map(str::to_owned)
}

/// Turns away a client while another session holds the slot.
async fn reject<S>(mut ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: Cow::Borrowed(SESSION_EXISTS_REASON),
    };
    if ws.close(Some(frame)).await.is_err() {
        return;
    }
    // Keep reading until the client answers our close frame; `timeout`
    // bounds how long a client that never answers can hold the task.
    let _ = timeout(REJECT_CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, protocols: &[&str]) -> Request {
        let mut builder = Request::builder().uri(path);
        for protocol in protocols {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, *protocol);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_negotiate_selects_first_offered_subprotocol() {
        // Arrange
        let req = request("/ebu-tt/publish", &["base64, binary"]);
        let mut negotiated = None;

        // Act
        let response = negotiate(&req, Response::new(()), "/ebu-tt/publish", &mut negotiated)
            .expect("matching path must be accepted");

        // Assert
        assert_eq!(negotiated.as_deref(), Some("base64"));
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "base64"
        );
    }

    #[test]
    fn test_negotiate_without_subprotocol_sets_no_header() {
        let req = request("/ebu-tt/publish", &[]);
        let mut negotiated = None;

        let response =
            negotiate(&req, Response::new(()), "/ebu-tt/publish", &mut negotiated).unwrap();

        assert!(negotiated.is_none());
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn test_negotiate_refuses_other_paths_with_400() {
        let req = request("/elsewhere", &["base64"]);
        let mut negotiated = None;

        let refusal =
            negotiate(&req, Response::new(()), "/ebu-tt/publish", &mut negotiated).unwrap_err();

        assert_eq!(refusal.status(), StatusCode::BAD_REQUEST);
        assert!(negotiated.is_none());
    }

    #[test]
    fn test_negotiate_ignores_query_string() {
        let req = request("/ebu-tt/publish?token=1", &[]);
        let mut negotiated = None;
        assert!(negotiate(&req, Response::new(()), "/ebu-tt/publish", &mut negotiated).is_ok());
    }

    #[test]
    fn test_first_subprotocol_spans_repeated_headers_and_skips_blanks() {
        let req = request("/", &[" , ", "binary", "base64"]);
        assert_eq!(first_subprotocol(req.headers()).as_deref(), Some("binary"));
    }
}
