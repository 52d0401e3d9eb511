//! ws2tcp-bridge library crate.
//!
//! Bridges exactly one WebSocket client at a time to a single upstream TCP
//! server.  Bytes are relayed in both directions, either raw in binary frames
//! or base64-encoded in text frames, depending on the subprotocol the client
//! negotiates.
//!
//! # Architecture
//!
//! ```text
//! WebSocket client (ws:// or wss://)
//!         ↕
//! [ws2tcp-bridge]
//!   ├── domain/           Pure types: BridgeConfig, FrameEncoding, previews
//!   ├── application/
//!   │     ├── registry/        one-slot admission (SessionRegistry)
//!   │     └── bridge_session/  relay + teardown (BridgeSession)
//!   └── infrastructure/
//!         ├── ws_server/  accept loop, handshake, TLS (tokio-tungstenite)
//!         └── tcp_target/ the upstream connection driver
//!         ↕
//! Upstream TCP server
//! ```
//!
//! # Layer rules
//!
//! - `domain` performs no I/O and has no async code.
//! - `application` decides what happens to an accepted connection; it drives
//!   the transports the infrastructure hands it but never opens sockets.
//! - `infrastructure` owns sockets, TLS, and tasks, and reports fatal upstream
//!   conditions as values instead of exiting the process.

/// Domain layer: pure configuration and encoding types (no I/O).
pub mod domain;

/// Application layer: session admission and relay.
pub mod application;

/// Infrastructure layer: WebSocket listener and upstream TCP connection.
pub mod infrastructure;
