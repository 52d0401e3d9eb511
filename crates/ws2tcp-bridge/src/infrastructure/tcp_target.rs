//! The single upstream TCP connection.
//!
//! [`TcpTarget`] is a cheap, cloneable handle to one outbound TCP connection
//! that lives for the whole process.  The socket itself is owned by a driver
//! task; the handle only talks to that task:
//!
//! ```text
//!   TcpTarget::write ──► outbound queue ──► driver ──► upstream socket
//!                                             │
//!   TargetSubscription ◄── TargetEvent ◄──────┘  (Data / End)
//! ```
//!
//! # Subscriptions
//!
//! At most one [`TargetSubscription`] exists at a time.  It is the session's
//! registration for "TCP data" and "TCP end": while it is alive, every chunk
//! the driver reads is delivered to it; once it is dropped, the driver
//! delivers nothing to that session again.  Chunks read while nobody is
//! subscribed are discarded.
//!
//! # Termination
//!
//! The driver ends on connection refusal, any socket error, or a clean close
//! by the upstream.  In every case it first sends [`TargetEvent::End`] to the
//! active subscriber, then shuts the socket down, then resolves its
//! `JoinHandle` with the matching [`FatalError`].  Deciding what to do with
//! the process is left to whoever awaits that handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::infrastructure::fatal::FatalError;

/// Size of the driver's read buffer; one read becomes at most one event.
const READ_CHUNK: usize = 16 * 1024;

/// Something that happened on the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// One chunk exactly as returned by a single socket read.
    Data(Vec<u8>),
    /// The upstream connection is gone; no further events follow.
    End,
}

/// Returned by [`TcpTarget::subscribe`] while another subscription is live.
#[derive(Debug, Error)]
#[error("tcp target {addr} already has an active subscriber")]
pub struct TargetBusy {
    pub addr: SocketAddr,
}

/// Handle to the upstream connection.  Clones share the same connection.
#[derive(Clone)]
pub struct TcpTarget {
    shared: Arc<Shared>,
}

struct Shared {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    subscriber: Mutex<Option<Subscriber>>,
    next_subscription: AtomicU64,
}

struct Subscriber {
    id: u64,
    events: mpsc::UnboundedSender<TargetEvent>,
}

impl TcpTarget {
    /// Starts connecting to `addr` in the background and returns immediately.
    ///
    /// The socket is opened with `SO_KEEPALIVE` enabled.  Writes issued before
    /// the connection is established are queued and flushed in order once it
    /// is.  The returned handle resolves when the connection is gone, with the
    /// reason.
    ///
    /// `span` is the logging context for everything the driver reports.
    pub fn connect(addr: SocketAddr, span: Span) -> (Self, JoinHandle<FatalError>) {
        let (target, outbound) = Self::new(addr);
        let driver = Driver {
            shared: Arc::clone(&target.shared),
            outbound,
        };

        // The connect runs inside the driver task so startup never waits for
        // it; writes issued meanwhile sit in the unbounded queue.
        let handle = tokio::spawn(
            async move {
                match open(addr).await {
                    Ok(stream) => {
                        info!("connected to {addr}");
                        driver.run(stream).await
                    }
                    Err(e) => driver.fail(FatalError::from_io(addr, e)),
                }
            }
            .instrument(span),
        );

        (target, handle)
    }

    /// Drives an already-open stream as the upstream connection.
    ///
    /// `addr` is only used for log lines and error values.
    pub fn attach<S>(stream: S, addr: SocketAddr, span: Span) -> (Self, JoinHandle<FatalError>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (target, outbound) = Self::new(addr);
        let driver = Driver {
            shared: Arc::clone(&target.shared),
            outbound,
        };
        let handle = tokio::spawn(driver.run(stream).instrument(span));
        (target, handle)
    }

    fn new(addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let target = Self {
            shared: Arc::new(Shared {
                addr,
                outbound: outbound_tx,
                subscriber: Mutex::new(None),
                next_subscription: AtomicU64::new(0),
            }),
        };
        (target, outbound_rx)
    }

    /// The upstream address.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Queues `bytes` for the upstream as a single write.
    ///
    /// Best effort: once the driver has ended the bytes are silently dropped.
    pub fn write(&self, bytes: Vec<u8>) {
        if self.shared.outbound.send(bytes).is_err() {
            debug!("tcp target {} is gone; write dropped", self.shared.addr);
        }
    }

    /// Registers for upstream data and end notifications.
    ///
    /// # Errors
    ///
    /// Returns [`TargetBusy`] while another subscription is alive.
    pub fn subscribe(&self) -> Result<TargetSubscription, TargetBusy> {
        let mut slot = self.shared.lock_subscriber();
        if slot.is_some() {
            return Err(TargetBusy {
                addr: self.shared.addr,
            });
        }

        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(Subscriber { id, events: tx });

        Ok(TargetSubscription {
            id,
            events: rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Whether a subscription is currently registered.
    pub fn has_subscriber(&self) -> bool {
        self.shared.lock_subscriber().is_some()
    }
}

impl std::fmt::Debug for TcpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTarget")
            .field("addr", &self.shared.addr)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock_subscriber(&self) -> std::sync::MutexGuard<'_, Option<Subscriber>> {
        // The guarded value is a plain Option; a panic elsewhere cannot leave
        // it half-written.
        self.subscriber.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `event` to the current subscriber.  Returns `false` when
    /// there is none (or it has stopped listening).
    fn publish(&self, event: TargetEvent) -> bool {
        let slot = self.lock_subscriber();
        match slot.as_ref() {
            Some(subscriber) => subscriber.events.send(event).is_ok(),
            None => false,
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut slot = self.lock_subscriber();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// A live registration for upstream events.  Dropping it unregisters.
pub struct TargetSubscription {
    id: u64,
    events: mpsc::UnboundedReceiver<TargetEvent>,
    shared: Arc<Shared>,
}

impl TargetSubscription {
    /// Waits for the next upstream event.
    ///
    /// Returns `None` only when the driver is gone without having delivered
    /// [`TargetEvent::End`] (for example if it panicked); callers should
    /// treat that like `End`.
    pub async fn next_event(&mut self) -> Option<TargetEvent> {
        self.events.recv().await
    }
}

impl Drop for TargetSubscription {
    fn drop(&mut self) {
        self.shared.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for TargetSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetSubscription")
            .field("id", &self.id)
            .field("addr", &self.shared.addr)
            .finish()
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

struct Driver {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Driver {
    async fn run<S>(mut self, stream: S) -> FatalError
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let addr = self.shared.addr;
        // `split` lets one task read and write the same socket; the halves
        // share it through an internal lock that is never held across awaits.
        let (mut reader, mut writer) = tokio::io::split(stream);
        // One buffer for the whole connection; each read copies out only the
        // bytes it received.
        let mut buf = vec![0u8; READ_CHUNK];

        let failure = loop {
            // Wait for whichever comes first: bytes from the upstream or a
            // queued write from the session.  `read` is cancel-safe, so losing
            // the race to a write never drops upstream data.
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    // A zero-length read is the upstream's FIN.
                    Ok(0) => break FatalError::Ended { addr },
                    Ok(n) => {
                        if !self.shared.publish(TargetEvent::Data(buf[..n].to_vec())) {
                            debug!("no active session; discarded {n} bytes from {addr}");
                        }
                    }
                    Err(e) => break FatalError::from_io(addr, e),
                },
                // `recv` yields `None` only once every `TcpTarget` clone is
                // gone; the pattern then disables this branch and the loop
                // keeps reading.
                Some(chunk) = self.outbound.recv() => {
                    // `write_all` keeps the chunk in one piece on the wire
                    // relative to other queued writes.
                    if let Err(e) = writer.write_all(&chunk).await {
                        break FatalError::from_io(addr, e);
                    }
                }
            }
        };

        // Best effort: the peer may already be gone.
        let _ = writer.shutdown().await;
        self.fail(failure)
    }

    fn fail(self, failure: FatalError) -> FatalError {
        match &failure {
            FatalError::Refused { addr } => error!("failed to connect to tcp socket on {addr}"),
            FatalError::Transport { source, .. } => error!("tcp connection error: {source}"),
            FatalError::Ended { .. } => warn!("tcp connection closed by upstream"),
        }
        // Tell the session before the handle resolves, so the client sees
        // its close frame ahead of the supervisor's shutdown.
        self.shared.publish(TargetEvent::End);
        failure
    }
}

async fn open(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
