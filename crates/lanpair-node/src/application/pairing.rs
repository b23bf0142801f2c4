//! End-to-end pairing flows for each role.
//!
//! These functions take a fresh [`Session`] from `Idle` to an attached
//! [`SessionHandle`] in `Pairing`; the handshake then completes inside the
//! session actor.  On every failure path the session is ended with exactly
//! one terminal event before the error is returned.
//!
//! - [`pair_as_receiver`]: advertise, accept one peer, stop advertising, attach.
//! - [`pair_as_sender`]: resolve a peer (or use a manual address), connect, attach.

use lanpair_core::{PeerAddress, ServiceMetadata, ServiceName};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::orchestrator::{PairingError, PairingOrchestrator};
use crate::application::session::{Session, SessionHandle};
use crate::infrastructure::discovery::DiscoveryBackend;
use crate::infrastructure::transport::{Acceptor, Connector, TransportError};

/// Where the Sender should connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTarget {
    /// Race broadcast discovery and subnet probing.
    Discover,
    /// Skip discovery and dial this address.
    Manual(PeerAddress),
}

/// Receiver side: advertise the session and wait for one peer.
///
/// Advertising is best effort; when it fails the listener still accepts peers
/// that found this host by probing or by manual address.
///
/// # Errors
///
/// [`PairingError::Cancelled`] when `cancel` fires before a peer connects,
/// [`PairingError::Transport`] when the listener fails, and
/// [`PairingError::Session`] if `session` was already started.
pub async fn pair_as_receiver(
    mut session: Session,
    acceptor: &dyn Acceptor,
    discovery: Option<&dyn DiscoveryBackend>,
    service: &ServiceName,
    cancel: &CancellationToken,
) -> Result<SessionHandle, PairingError> {
    session.begin()?;

    let port = match acceptor.local_port() {
        Ok(port) => port,
        Err(e) => {
            session.abandon(e.to_string()).await;
            return Err(e.into());
        }
    };

    if let Some(backend) = discovery {
        let metadata = ServiceMetadata::for_identity(session.identity()).to_txt();
        match backend.advertise(service, port, &metadata).await {
            Ok(()) => info!("advertising session {} on port {port}", session.session_id()),
            Err(e) => warn!("advertising failed, waiting for probed or manual peers: {e}"),
        }
    }

    let accepted = acceptor.accept_transport(cancel).await;
    if let Some(backend) = discovery {
        backend.stop_advertising().await;
    }

    match accepted {
        Ok(transport) => Ok(session.attach(transport).await?),
        Err(TransportError::Cancelled) => {
            session.cancel().await;
            Err(PairingError::Cancelled)
        }
        Err(e) => {
            session.abandon(e.to_string()).await;
            Err(e.into())
        }
    }
}

/// Sender side: find the Receiver, connect and start the handshake.
///
/// # Errors
///
/// Any [`PairingError`] from resolution, [`PairingError::Transport`] when the
/// connection fails, and [`PairingError::Session`] if `session` was already
/// started.
pub async fn pair_as_sender(
    mut session: Session,
    orchestrator: &PairingOrchestrator,
    connector: &dyn Connector,
    target: PeerTarget,
    cancel: &CancellationToken,
) -> Result<SessionHandle, PairingError> {
    session.begin()?;

    let address = match target {
        PeerTarget::Manual(address) => {
            info!("connecting to manually entered peer {address}");
            address
        }
        PeerTarget::Discover => {
            let resolved = orchestrator.resolve_peer(session.session_id(), cancel).await;
            match resolved {
                Ok(found) => found.address,
                Err(PairingError::Cancelled) => {
                    session.cancel().await;
                    return Err(PairingError::Cancelled);
                }
                Err(e) => {
                    session.abandon(e.to_string()).await;
                    return Err(e);
                }
            }
        }
    };

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        connected = connector.connect(address) => connected,
    };

    match connected {
        Ok(transport) => Ok(session.attach(transport).await?),
        Err(TransportError::Cancelled) => {
            session.cancel().await;
            Err(PairingError::Cancelled)
        }
        Err(e) => {
            session.abandon(e.to_string()).await;
            Err(e.into())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
