//! Domain layer for ws2tcp-bridge.
//!
//! Pure types with no dependencies on I/O, sockets, or the async runtime:
//!
//! - Configuration values and their resolution rules ([`config`])
//! - The binary/base64 frame encoding selected per session ([`encoding`])
//! - Payload previews for verbose logs ([`payload`])
//!
//! Anything that could block, read the environment, or touch the network
//! lives in `infrastructure` instead.

pub mod config;
pub mod encoding;
pub mod payload;

pub use config::{BridgeConfig, PortResolution, TlsFiles, TlsSelection};
pub use encoding::{EncodedFrame, FrameEncoding};
