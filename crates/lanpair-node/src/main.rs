//! `lanpair` command-line entry point.
//!
//! ```text
//! lanpair receive [--port PORT]              # prints a code, waits for a sender
//! lanpair send --code CODE [--peer HOST:PORT]
//! lanpair config                             # writes the effective config file
//! ```
//!
//! Once paired, lines typed on stdin are sent to the peer and received data
//! is printed.  Ctrl-C closes the session.
//!
//! # Startup
//!
//! 1. CLI arguments are parsed with `clap`.
//! 2. The TOML config is loaded (`--config` or the platform default path).
//! 3. `tracing_subscriber` is initialised; `RUST_LOG` overrides the configured
//!    level.
//! 4. The discovery backend is opened once, if enabled and available, and
//!    passed to the pairing flow explicitly.

use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanpair_core::{LocalIdentity, PeerAddress, Role, ServiceName, SessionId};
use lanpair_node::application::{
    pair_as_receiver, pair_as_sender, PairingOrchestrator, PeerTarget, Session, SessionConfig,
    SessionEvent, SessionHandle,
};
use lanpair_node::infrastructure::discovery::udp::{UdpBroadcastDiscovery, UdpDiscoveryConfig};
use lanpair_node::infrastructure::discovery::DiscoveryBackend;
use lanpair_node::infrastructure::probe::{local_ipv4, SubnetProber};
use lanpair_node::infrastructure::storage::config::{
    config_file_path, load_config, load_config_from, save_config, save_config_to, AppConfig,
};
use lanpair_node::infrastructure::transport::ws::{WsConnector, WsListener};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Pair two devices on the same LAN with a short session code.
#[derive(Debug, Parser)]
#[command(name = "lanpair", version)]
struct Cli {
    /// Path to a config file; defaults to the platform config directory.
    #[arg(long, global = true, env = "LANPAIR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a session code and wait for a sender.
    Receive {
        /// Transport port to listen on (overrides `network.transport_port`).
        #[arg(long, env = "LANPAIR_PORT")]
        port: Option<u16>,
    },
    /// Connect to a receiver showing `--code`.
    Send {
        /// The six-character code shown by the receiver.
        #[arg(long)]
        code: String,

        /// Skip discovery and connect to this address.
        #[arg(long)]
        peer: Option<PeerAddress>,
    },
    /// Write the effective configuration (defaults filled in) to the config file.
    Config,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => load_config().context("failed to load config")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Command::Config = cli.command {
        return write_config(&config, cli.config.as_deref());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            ctrl_c.cancel();
        }
    });

    let discovery = open_discovery(&config).await?;
    let session_config = SessionConfig {
        handshake_timeout: config.pairing.handshake_timeout(),
    };

    match cli.command {
        Command::Receive { port } => {
            let code = SessionId::generate();
            let identity = LocalIdentity::new(Role::Receiver, code.clone());
            let (session, events) = Session::new(identity, session_config);

            let bind_ip = config.network.bind_ipv4()?;
            let port = port.unwrap_or(config.network.transport_port);
            let listener = WsListener::bind(SocketAddr::V4(SocketAddrV4::new(bind_ip, port))).await?;

            println!("Session code: {code}");
            let service = ServiceName::new(config.pairing.service_name.as_str());
            let handle = pair_as_receiver(
                session,
                &listener,
                discovery.as_deref(),
                &service,
                &cancel,
            )
            .await?;
            run_session(handle, events, cancel).await
        }
        Command::Send { code, peer } => {
            let code = SessionId::from_user_input(&code)?;
            let identity = LocalIdentity::new(Role::Sender, code);
            let (session, events) = Session::new(identity, session_config);

            let orchestrator = build_orchestrator(&config, discovery);
            let target = peer.map_or(PeerTarget::Discover, PeerTarget::Manual);
            let handle = pair_as_sender(
                session,
                &orchestrator,
                &WsConnector::default(),
                target,
                &cancel,
            )
            .await?;
            run_session(handle, events, cancel).await
        }
        Command::Config => Ok(()),
    }
}

/// Saves `config` to `path`, or to the platform config file.
fn write_config(config: &AppConfig, path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let written = match path {
        Some(path) => {
            save_config_to(config, path)?;
            path.to_path_buf()
        }
        None => {
            save_config(config)?;
            config_file_path()?
        }
    };
    info!("configuration written to {}", written.display());
    println!("{}", written.display());
    Ok(())
}

/// Opens the broadcast backend when enabled.  Unavailability is not an error;
/// pairing continues with the remaining strategies.
async fn open_discovery(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn DiscoveryBackend>>> {
    if !config.pairing.enable_broadcast {
        return Ok(None);
    }
    let udp_config = UdpDiscoveryConfig {
        discovery_port: config.network.discovery_port,
        bind_address: config.network.bind_ipv4()?,
        broadcast_address: config.network.broadcast_ipv4()?,
        query_interval: config.pairing.query_interval(),
        advertised_host: None,
    };
    match UdpBroadcastDiscovery::bind(udp_config).await {
        Ok(backend) => Ok(Some(Arc::new(backend))),
        Err(e) => {
            warn!("{e}; continuing without broadcast discovery");
            Ok(None)
        }
    }
}

fn build_orchestrator(
    config: &AppConfig,
    discovery: Option<Arc<dyn DiscoveryBackend>>,
) -> PairingOrchestrator {
    let service = ServiceName::new(config.pairing.service_name.as_str());
    let orchestrator = PairingOrchestrator::new(service, config.pairing.discovery_timeout())
        .with_discovery(discovery);
    if !config.pairing.enable_subnet_probe {
        return orchestrator;
    }
    match local_ipv4() {
        Some(ip) => orchestrator.with_prober(
            SubnetProber::new(config.network.transport_port, config.pairing.probe_timeout()),
            ip,
        ),
        None => {
            warn!("no local IPv4 address; subnet probing disabled");
            orchestrator
        }
    }
}

/// Relays stdin to the peer and prints events until the session ends.
async fn run_session(
    handle: SessionHandle,
    mut events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut closing = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !closing => {
                closing = true;
                handle.close().await;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected { peer: Some(peer) } => println!("Connected to {peer}"),
                    SessionEvent::Connected { peer: None } => println!("Connected"),
                    SessionEvent::Active { peer_key } => println!("Paired with {peer_key}"),
                    SessionEvent::DataReceived(bytes) => {
                        println!("< {}", String::from_utf8_lossy(&bytes));
                    }
                    SessionEvent::PairingFailed(failure) => {
                        anyhow::bail!("pairing failed: {failure}");
                    }
                    SessionEvent::ErrorOccurred(reason) => {
                        anyhow::bail!("session error: {reason}");
                    }
                    SessionEvent::Closed => {
                        println!("Session closed");
                        break;
                    }
                }
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Err(e) = handle.send(line.into_bytes()).await {
                        warn!("not sent: {e}");
                    }
                }
                None => stdin_open = false,
            },
        }
    }
    Ok(())
}
