//! One WebSocket client bridged to the shared upstream.
//!
//! A [`BridgeSession`] owns the accepted WebSocket and borrows the upstream
//! through a [`TargetSubscription`].  Its life has three phases:
//!
//! 1. **init** – subscribe to upstream data/end.  Together with the
//!    WebSocket stream the session now owns, this covers every event it
//!    reacts to: TCP data, TCP end, WebSocket message, WebSocket close,
//!    WebSocket error.
//! 2. **relay** – a single loop that waits on both sides and handles one
//!    event at a time, so a message is fully relayed before the next one on
//!    the same side is looked at.
//! 3. **destroy** – the subscription and the WebSocket are dropped when
//!    `run` returns.  After that nothing reaches the former transports on
//!    this session's behalf; there is no callback left to forget.
//!
//! # Relay rules
//!
//! | Event                | Action                                                |
//! |----------------------|-------------------------------------------------------|
//! | TCP data             | one WebSocket message, encoded per [`FrameEncoding`]  |
//! | TCP end              | close the WebSocket, end the session                  |
//! | WS text/binary       | decode per [`FrameEncoding`], one TCP write           |
//! | WS malformed base64  | drop the message with a warning                       |
//! | WS close             | end the session                                       |
//! | WS error             | end the session (the upstream stays up)               |
//! | WS send failure      | close the WebSocket, end the session                  |

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn, Instrument, Span};

use crate::domain::encoding::{EncodedFrame, FrameEncoding};
use crate::domain::payload::preview;
use crate::infrastructure::tcp_target::{TargetBusy, TargetEvent, TargetSubscription, TcpTarget};

/// How long to wait for the client's reply after the bridge sends a close
/// frame before dropping the connection anyway.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Error type ────────────────────────────────────────────────────────────────

/// Failures local to one session.  None of them affect the upstream.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A client message in base64 mode could not be decoded.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// Another subscription already holds the upstream.
    #[error(transparent)]
    UpstreamBusy(#[from] TargetBusy),

    /// Sending to or receiving from the client failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the WebSocket (or its stream ended).
    ClientClosed { code: Option<u16>, reason: String },
    /// The WebSocket failed while reading from the client.
    ClientError(String),
    /// The upstream connection ended; the client was sent a close frame.
    UpstreamEnded,
    /// Relaying upstream data to the client failed; the WebSocket was closed.
    SendFailed(String),
    /// The upstream was already subscribed by someone else.
    UpstreamBusy,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// The live binding between one WebSocket and the shared [`TcpTarget`].
pub struct BridgeSession<S> {
    ws: WebSocketStream<S>,
    target: TcpTarget,
    encoding: FrameEncoding,
    verbose: bool,
    span: Span,
}

impl<S> BridgeSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds `ws` to `target`.
    ///
    /// `encoding` is fixed for the session's lifetime.  When `verbose` is
    /// set, a preview of every relayed payload is logged.  All log lines of
    /// the session are emitted inside `span`.
    pub fn new(
        ws: WebSocketStream<S>,
        target: TcpTarget,
        encoding: FrameEncoding,
        verbose: bool,
        span: Span,
    ) -> Self {
        Self {
            ws,
            target,
            encoding,
            verbose,
            span,
        }
    }

    /// Runs the session to completion and tears it down.
    ///
    /// Never panics on client or upstream failures; the returned
    /// [`SessionEnd`] says what happened.
    pub async fn run(mut self) -> SessionEnd {
        let span = self.span.clone();
        async move {
            let end = match self.target.subscribe() {
                Ok(subscription) => self.relay(subscription).await,
                Err(busy) => {
                    warn!("{}", BridgeError::from(busy));
                    self.close(CloseCode::Error, "upstream busy").await;
                    SessionEnd::UpstreamBusy
                }
            };
            debug!("session detached from {}", self.target.addr());
            end
        }
        .instrument(span)
        .await
    }

    async fn relay(&mut self, mut subscription: TargetSubscription) -> SessionEnd {
        let mut client_close: Option<(u16, String)> = None;

        loop {
            // Both branches are cancel-safe: whichever loses the race simply
            // gets polled again on the next iteration.  Handlers run after the
            // losing future is dropped, so they may borrow `self.ws` freely.
            tokio::select! {
                event = subscription.next_event() => match event {
                    Some(TargetEvent::Data(chunk)) => {
                        // A failed send means the client is unusable; the
                        // upstream is left untouched for the next session.
                        if let Err(e) = self.on_tcp_data(&chunk).await {
                            warn!("websocket exception, closing session: {e}");
                            self.close(CloseCode::Error, "relay failed").await;
                            return SessionEnd::SendFailed(e.to_string());
                        }
                    }
                    Some(TargetEvent::End) | None => {
                        info!("tcp disconnected, closing websocket session");
                        // Unregister before waiting on the close handshake.
                        drop(subscription);
                        self.close(CloseCode::Away, "upstream disconnected").await;
                        return SessionEnd::UpstreamEnded;
                    }
                },

                message = self.ws.next() => match message {
                    // Text and binary frames both carry payload bytes; the
                    // encoding decides how they are interpreted.
                    Some(Ok(WsMessage::Text(text))) => self.on_ws_message(text.as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => self.on_ws_message(&data),
                    Some(Ok(WsMessage::Close(frame))) => {
                        // tungstenite queues the close reply; the stream ends
                        // once it has been flushed.
                        client_close = frame.map(|f| (u16::from(f.code), f.reason.into_owned()));
                    }
                    // tungstenite answers pings itself; control frames are
                    // never relayed.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                        let (code, reason) = match client_close.take() {
                            Some((code, reason)) => (Some(code), reason),
                            None => (None, String::new()),
                        };
                        info!(
                            "ws disconnected: {}[{reason}]",
                            code.map_or_else(|| "-".to_string(), |c| c.to_string())
                        );
                        return SessionEnd::ClientClosed { code, reason };
                    }
                    Some(Err(e)) => {
                        warn!("websocket error: {e}");
                        return SessionEnd::ClientError(e.to_string());
                    }
                },
            }
        }
    }

    /// Upstream → client: one chunk becomes one WebSocket message.
    async fn on_tcp_data(&mut self, chunk: &[u8]) -> Result<(), BridgeError> {
        if self.verbose {
            info!("<-- {}", preview(chunk));
        } else {
            debug!("<-- {} bytes", chunk.len());
        }

        let message = match self.encoding.encode(chunk) {
            EncodedFrame::Text(text) => WsMessage::Text(text),
            EncodedFrame::Binary(bytes) => WsMessage::Binary(bytes),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    /// Client → upstream: one WebSocket message becomes one TCP write.
    fn on_ws_message(&self, payload: &[u8]) {
        match self.encoding.decode(payload) {
            Ok(bytes) => {
                if self.verbose {
                    info!("--> {}", preview(&bytes));
                } else {
                    debug!("--> {} bytes", bytes.len());
                }
                self.target.write(bytes);
            }
            Err(e) => warn!("dropping client message: {}", BridgeError::from(e)),
        }
    }

    /// Sends a close frame and waits (bounded) for the client's reply.
    async fn close(&mut self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!("close frame not sent: {e}");
            return;
        }

        let ws = &mut self.ws;
        let drained = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        if drained.is_err() {
            debug!("client did not complete the close handshake");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
