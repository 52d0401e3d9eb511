//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is built once at startup by `main.rs` from CLI arguments and
//! environment variables, then handed to the listener and the upstream
//! driver.
//!
//! The resolution helpers in this module ([`resolve_ws_port`],
//! [`ws_path_for`], [`TlsSelection::from_paths`]) are pure: they never log
//! and never read the environment.  When a raw value is rejected they return
//! a description of what happened so the caller can log it at the right
//! level.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Listen port used when `SUBSTANCE_WS_PORT` is absent or unusable.
pub const DEFAULT_WS_PORT: u16 = 9998;

/// Path segment used when no sequence identifier is configured.
pub const DEFAULT_SEQUENCE_ID: &str = "ebu-tt";

/// Upstream TCP host the bridge forwards to unless told otherwise.
pub const DEFAULT_TCP_HOST: &str = "127.0.0.1";

/// Upstream TCP port the bridge forwards to unless told otherwise.
pub const DEFAULT_TCP_PORT: u16 = 9999;

/// All runtime configuration for the bridge.
///
/// # Example
///
/// ```rust
/// use ws2tcp_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 9998);
/// assert_eq!(cfg.ws_path, "/ebu-tt/publish");
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address and port the WebSocket listener binds to.
    pub ws_bind_addr: SocketAddr,

    /// The only request path the listener upgrades; anything else is
    /// refused during the handshake.
    pub ws_path: String,

    /// The single upstream TCP server.  Fixed for the process lifetime.
    pub upstream_addr: SocketAddr,

    /// Certificate and key files when the listener terminates TLS.
    pub tls: Option<TlsFiles>,

    /// Log a hex/ASCII preview of every relayed chunk.
    pub verbose: bool,
}

impl Default for BridgeConfig {
    /// | Field          | Default            |
    /// |----------------|--------------------|
    /// | ws_bind_addr   | `0.0.0.0:9998`     |
    /// | ws_path        | `/ebu-tt/publish`  |
    /// | upstream_addr  | `127.0.0.1:9999`   |
    /// | tls            | none (plaintext)   |
    /// | verbose        | `false`            |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
            ws_path: ws_path_for(DEFAULT_SEQUENCE_ID),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)),
            tls: None,
            verbose: false,
        }
    }
}

// ── Listen port ───────────────────────────────────────────────────────────────

/// Outcome of interpreting a raw listen-port value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortResolution {
    /// The raw value was absent; the default applies silently.
    Default(u16),
    /// The raw value was a valid port.
    Configured(u16),
    /// The raw value was present but unusable; the default applies and the
    /// caller should warn.
    Fallback { raw: String, port: u16 },
}

impl PortResolution {
    /// The effective port regardless of how it was obtained.
    pub fn port(&self) -> u16 {
        match self {
            Self::Default(port) | Self::Configured(port) => *port,
            Self::Fallback { port, .. } => *port,
        }
    }
}

/// Interprets the raw `SUBSTANCE_WS_PORT` / `--ws-port` value.
///
/// Accepts any integer in `0..=65535` (surrounding whitespace ignored).
/// Anything else (out of range, negative, non-numeric or empty) falls back
/// to [`DEFAULT_WS_PORT`].
///
/// ```rust
/// use ws2tcp_bridge::domain::config::{resolve_ws_port, PortResolution};
///
/// assert_eq!(resolve_ws_port(Some("8080")), PortResolution::Configured(8080));
/// assert_eq!(resolve_ws_port(Some("70000")).port(), 9998);
/// ```
pub fn resolve_ws_port(raw: Option<&str>) -> PortResolution {
    let Some(raw) = raw else {
        return PortResolution::Default(DEFAULT_WS_PORT);
    };

    // Parse wide first so "70000" is an out-of-range number rather than a
    // parse error; both fall back the same way.
    match raw.trim().parse::<i64>() {
        Ok(n) if (0..=i64::from(u16::MAX)).contains(&n) => PortResolution::Configured(n as u16),
        _ => PortResolution::Fallback {
            raw: raw.to_string(),
            port: DEFAULT_WS_PORT,
        },
    }
}

// ── Path ──────────────────────────────────────────────────────────────────────

/// Builds the WebSocket path `/<sequence-id>/publish`.
///
/// Slashes around the identifier are trimmed; a blank identifier falls back
/// to [`DEFAULT_SEQUENCE_ID`].
pub fn ws_path_for(sequence_id: &str) -> String {
    let segment = sequence_id.trim().trim_matches('/');
    let segment = if segment.is_empty() {
        DEFAULT_SEQUENCE_ID
    } else {
        segment
    };
    format!("/{segment}/publish")
}

// ── TLS ───────────────────────────────────────────────────────────────────────

/// PEM files used to terminate TLS on the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// Certificate chain, leaf first.
    pub cert: PathBuf,
    /// PKCS#8, PKCS#1 or SEC1 private key matching the leaf certificate.
    pub key: PathBuf,
}

/// What the listener should do given the optional certificate and key paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSelection {
    /// Both files were given: serve `wss://`.
    Enabled(TlsFiles),
    /// Neither file was given: serve `ws://`.
    Disabled,
    /// Only one of the two was given.  The listener serves `ws://` and the
    /// caller should warn about the missing half.
    Incomplete { missing: &'static str },
}

impl TlsSelection {
    pub fn from_paths(cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        match (cert, key) {
            (Some(cert), Some(key)) => Self::Enabled(TlsFiles { cert, key }),
            (None, None) => Self::Disabled,
            (Some(_), None) => Self::Incomplete {
                missing: "private key",
            },
            (None, Some(_)) => Self::Incomplete {
                missing: "certificate",
            },
        }
    }

    /// The files to use, if TLS is on.
    pub fn into_files(self) -> Option<TlsFiles> {
        match self {
            Self::Enabled(files) => Some(files),
            Self::Disabled | Self::Incomplete { .. } => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
