//! Fatal upstream conditions.
//!
//! The bridge has exactly one upstream and no failover, so every way the
//! upstream connection can end is fatal to the process.  The upstream driver
//! never exits the process itself: it resolves with a [`FatalError`] and the
//! supervisor in `main.rs` turns that into an exit status.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why the upstream connection is gone.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Nothing is listening at the upstream address.
    #[error("failed to connect to tcp socket on {addr}")]
    Refused { addr: SocketAddr },

    /// Any other socket-level failure (reset, unreachable, write error, ...).
    #[error("tcp connection to {addr} failed: {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The upstream closed its side cleanly.
    #[error("tcp connection to {addr} closed by peer")]
    Ended { addr: SocketAddr },
}

impl FatalError {
    /// Classifies an I/O error from connecting to, reading from, or writing
    /// to the upstream.
    pub fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused { addr },
            _ => Self::Transport { addr, source },
        }
    }

    /// Process exit status for this condition: `0` for a clean upstream
    /// close, `1` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ended { .. } => 0,
            Self::Refused { .. } | Self::Transport { .. } => 1,
        }
    }
}
