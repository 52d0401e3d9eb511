//! ws2tcp-bridge: entry point and process supervisor.
//!
//! This binary accepts one WebSocket client at a time and relays its traffic
//! to a single upstream TCP server.  A second client is turned away while a
//! session is active.  Losing the upstream ends the process.
//!
//! # Usage
//!
//! ```text
//! ws2tcp-bridge [OPTIONS]
//!
//! Options:
//!   --ws-port     <PORT>   WebSocket listener port [default: 9998]
//!   --ws-bind     <IP>     WebSocket bind address [default: 0.0.0.0]
//!   --sequence-id <ID>     Path segment, served at /<ID>/publish [default: ebu-tt]
//!   --tcp-host    <IP>     Upstream TCP host [default: 127.0.0.1]
//!   --tcp-port    <PORT>   Upstream TCP port [default: 9999]
//!   --tls-cert    <PATH>   PEM certificate chain (enables wss:// with --tls-key)
//!   --tls-key     <PATH>   PEM private key (enables wss:// with --tls-cert)
//!   --verbose              Log a preview of every relayed payload
//! ```
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present.
//!
//! | Variable                | Default     |
//! |-------------------------|-------------|
//! | `SUBSTANCE_WS_PORT`     | `9998`      |
//! | `SUBSTANCE_WS_BIND`     | `0.0.0.0`   |
//! | `SUBSTANCE_SEQUENCE_ID` | `ebu-tt`    |
//! | `SUBSTANCE_TCP_HOST`    | `127.0.0.1` |
//! | `SUBSTANCE_TCP_PORT`    | `9999`      |
//! | `SUBSTANCE_TLS_CERT`    | unset       |
//! | `SUBSTANCE_TLS_KEY`     | unset       |
//! | `SUBSTANCE_VERBOSE`     | `false`     |
//!
//! An unusable `SUBSTANCE_WS_PORT` (out of range, not a number) is not an
//! error: the default port is used and a warning is logged.
//!
//! # Exit status
//!
//! | Cause                                   | Status |
//! |-----------------------------------------|--------|
//! | Upstream closed the connection cleanly  | 0      |
//! | Ctrl+C                                  | 0      |
//! | Upstream refused the connection         | 1      |
//! | Any other upstream socket error         | 1      |
//! | Invalid configuration / bind failure    | 1      |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use ws2tcp_bridge::application::SessionRegistry;
use ws2tcp_bridge::domain::config::{
    resolve_ws_port, ws_path_for, PortResolution, DEFAULT_SEQUENCE_ID, DEFAULT_TCP_HOST,
    DEFAULT_TCP_PORT,
};
use ws2tcp_bridge::domain::{BridgeConfig, TlsSelection};
use ws2tcp_bridge::infrastructure::tls::load_acceptor;
use ws2tcp_bridge::infrastructure::{ServerContext, TcpTarget, WsServer};

/// How long the active session gets to finish its close handshake after the
/// upstream is lost.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Single-session WebSocket-to-TCP bridge.
#[derive(Debug, Parser)]
#[command(
    name = "ws2tcp-bridge",
    about = "Bridges one WebSocket client at a time to a fixed TCP server",
    version
)]
struct Cli {
    /// WebSocket listener port (0-65535).
    ///
    /// Kept as text so an out-of-range value can fall back to the default
    /// instead of aborting startup.
    #[arg(long, env = "SUBSTANCE_WS_PORT")]
    ws_port: Option<String>,

    /// IP address to bind the WebSocket listener to.
    #[arg(long, default_value = "0.0.0.0", env = "SUBSTANCE_WS_BIND")]
    ws_bind: String,

    /// Identifier used as the first path segment: `/<ID>/publish`.
    #[arg(long, default_value = DEFAULT_SEQUENCE_ID, env = "SUBSTANCE_SEQUENCE_ID")]
    sequence_id: String,

    /// IP address of the upstream TCP server.
    #[arg(long, default_value = DEFAULT_TCP_HOST, env = "SUBSTANCE_TCP_HOST")]
    tcp_host: String,

    /// Port of the upstream TCP server.
    #[arg(long, default_value_t = DEFAULT_TCP_PORT, env = "SUBSTANCE_TCP_PORT")]
    tcp_port: u16,

    /// PEM certificate chain for wss://.
    #[arg(long, env = "SUBSTANCE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for wss://.
    #[arg(long, env = "SUBSTANCE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Log a hex/ASCII preview of every relayed payload.
    #[arg(long, env = "SUBSTANCE_VERBOSE")]
    verbose: bool,
}

impl Cli {
    /// Converts the parsed arguments into a [`BridgeConfig`], logging a
    /// warning for every value that had to fall back.
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` or `--tcp-host` is not a valid IP
    /// address.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let ws_port = match resolve_ws_port(self.ws_port.as_deref()) {
            PortResolution::Fallback { raw, port } => {
                warn!("invalid WebSocket port {raw:?}; using default {port}");
                port
            }
            resolved => resolved.port(),
        };

        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, ws_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid WebSocket bind address: '{}:{}'",
                    self.ws_bind, ws_port
                )
            })?;

        let upstream_addr: SocketAddr = format!("{}:{}", self.tcp_host, self.tcp_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid upstream address: '{}:{}'",
                    self.tcp_host, self.tcp_port
                )
            })?;

        let tls = match TlsSelection::from_paths(self.tls_cert, self.tls_key) {
            TlsSelection::Incomplete { missing } => {
                warn!("TLS {missing} not configured; serving plain ws://");
                None
            }
            selection => selection.into_files(),
        };

        Ok(BridgeConfig {
            ws_bind_addr,
            ws_path: ws_path_for(&self.sequence_id),
            upstream_addr,
            tls,
            verbose: self.verbose,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// Every transport callback runs on one thread, so session handling is
/// strictly sequential per event source.
///
/// # What happens at startup
///
/// 1. `tracing_subscriber` is initialised; `RUST_LOG` picks the level
///    (default `info`).
/// 2. CLI arguments and environment variables become a [`BridgeConfig`].
/// 3. TLS material is loaded if configured.
/// 4. The upstream connection starts in the background.
/// 5. The WebSocket listener is bound and starts accepting.
/// 6. The supervisor waits for the upstream to be lost or for Ctrl+C and
///    exits with the matching status.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Cli::parse().into_bridge_config()?;

    info!(
        "ws2tcp bridge starting: ws={}{}, upstream={}",
        config.ws_bind_addr, config.ws_path, config.upstream_addr
    );

    let tls = config
        .tls
        .as_ref()
        .map(load_acceptor)
        .transpose()
        .context("failed to load TLS certificate/key")?;

    // ── Upstream ──────────────────────────────────────────────────────────────
    //
    // Startup does not wait for the connection; writes queue until it is up.
    let (target, driver) = TcpTarget::connect(
        config.upstream_addr,
        info_span!("tcp_target", component = "tcp_target", upstream = %config.upstream_addr),
    );

    // ── Listener ──────────────────────────────────────────────────────────────
    let registry = SessionRegistry::new();
    let server = WsServer::bind(
        config.ws_bind_addr,
        ServerContext {
            path: config.ws_path.clone(),
            target,
            registry: registry.clone(),
            tls,
            verbose: config.verbose,
        },
    )
    .await?;
    let listener_span = info_span!("listener", component = "listener");

    // ── Supervision ───────────────────────────────────────────────────────────
    let exit_code = tokio::select! {
        joined = driver => {
            let code = match joined {
                Ok(fatal) => {
                    error!("upstream lost: {fatal}; exiting with status {}", fatal.exit_code());
                    fatal.exit_code()
                }
                Err(e) => {
                    error!("upstream driver stopped unexpectedly: {e}");
                    1
                }
            };
            // The session was told to close; give the close handshake a moment.
            if tokio::time::timeout(SHUTDOWN_GRACE, registry.wait_until_empty())
                .await
                .is_err()
            {
                warn!("active session still open at shutdown");
            }
            code
        }
        () = server.run().instrument(listener_span) => {
            error!("WebSocket listener stopped unexpectedly");
            1
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("received Ctrl+C, shutting down"),
                Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
            }
            0
        }
    };

    std::process::exit(exit_code);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
