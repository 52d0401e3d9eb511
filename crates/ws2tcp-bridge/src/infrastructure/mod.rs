//! Infrastructure layer for ws2tcp-bridge.
//!
//! Everything that touches a socket or a file lives here:
//!
//! - [`tcp_target`] – the single upstream TCP connection and its driver task
//! - [`fatal`]      – the typed reasons the upstream can be lost
//! - [`ws_server`]  – the WebSocket listener, handshake, and admission
//! - [`tls`]        – loading certificate and key for `wss://`
//!
//! The infrastructure never exits the process.  Fatal conditions come back
//! to `main.rs` as values.

pub mod fatal;
pub mod tcp_target;
pub mod tls;
pub mod ws_server;

pub use fatal::FatalError;
pub use tcp_target::{TargetEvent, TargetSubscription, TcpTarget};
pub use ws_server::{ServerContext, WsServer};
