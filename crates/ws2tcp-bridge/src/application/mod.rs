//! Application layer for ws2tcp-bridge.
//!
//! The application layer decides *what* happens to a connection once the
//! infrastructure has accepted it:
//!
//! - [`registry`] admits at most one session at a time.
//! - [`bridge_session`] relays bytes between the admitted WebSocket and the
//!   upstream, applying the session's [`FrameEncoding`](crate::domain::FrameEncoding),
//!   and tears itself down on close, error, or upstream loss.
//!
//! Binding sockets, TLS, and the HTTP upgrade stay in the infrastructure
//! layer.

pub mod bridge_session;
pub mod registry;

pub use bridge_session::{BridgeError, BridgeSession, SessionEnd};
pub use registry::{ActiveSession, Rejected, SessionHandle, SessionId, SessionRegistry};
