//! Pairing orchestration: turning a session code into a peer address.
//!
//! [`PairingOrchestrator::resolve_peer`] runs broadcast discovery and the
//! subnet prober side by side and returns whichever produces a usable
//! candidate first.  The loser is dropped, which tears it down.
//!
//! Discovery records are hints.  A record whose `sid` differs from the code
//! being paired, or is not a session code at all, is skipped and the race goes
//! on; a record without a `sid` is accepted and left for the handshake to
//! confirm.  Probe hits carry no
//! identity at all.
//!
//! Both strategies are optional.  The discovery backend is passed in
//! explicitly (there is no process-wide instance), and the prober needs a
//! known local IPv4 address.  With neither available the call fails at once
//! with [`PairingError::DiscoveryUnavailable`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use lanpair_core::{DiscoveredService, DiscoverySource, ServiceName, SessionId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::session::SessionError;
use crate::infrastructure::discovery::{DiscoveryBackend, DiscoveryError};
use crate::infrastructure::probe::{ProbeOutcome, SubnetProber};
use crate::infrastructure::transport::TransportError;

/// Overall discovery budget used when none is configured.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from resolving and connecting to a peer.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Neither broadcast discovery nor subnet probing can run on this host.
    #[error("no discovery strategy available: {0}")]
    DiscoveryUnavailable(String),

    /// The discovery budget elapsed without a usable candidate.
    #[error("no peer found within {0:?}")]
    DiscoveryTimeout(Duration),

    /// Every strategy finished without a usable candidate.
    #[error("no peer found")]
    NotFound,

    /// The caller aborted.
    #[error("pairing cancelled")]
    Cancelled,

    /// The discovery backend failed while advertising.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Races the available discovery strategies for one session code.
pub struct PairingOrchestrator {
    service: ServiceName,
    discovery_timeout: Duration,
    discovery: Option<Arc<dyn DiscoveryBackend>>,
    prober: Option<(SubnetProber, Ipv4Addr)>,
}

impl PairingOrchestrator {
    /// An orchestrator with no strategies; add them with the `with_*` methods.
    pub fn new(service: ServiceName, discovery_timeout: Duration) -> Self {
        Self {
            service,
            discovery_timeout,
            discovery: None,
            prober: None,
        }
    }

    /// Uses `backend` for broadcast browsing.  `None` disables the strategy.
    pub fn with_discovery(mut self, backend: Option<Arc<dyn DiscoveryBackend>>) -> Self {
        self.discovery = backend;
        self
    }

    /// Probes the /24 around `local_ip` with `prober`.
    pub fn with_prober(mut self, prober: SubnetProber, local_ip: Ipv4Addr) -> Self {
        self.prober = Some((prober, local_ip));
        self
    }

    pub fn has_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn has_prober(&self) -> bool {
        self.prober.is_some()
    }

    /// Finds a candidate peer for `expected`.
    ///
    /// # Errors
    ///
    /// - [`PairingError::DiscoveryUnavailable`] when no strategy is configured.
    /// - [`PairingError::DiscoveryTimeout`] when the budget elapses.
    /// - [`PairingError::NotFound`] when every strategy finished empty-handed.
    /// - [`PairingError::Cancelled`] when `cancel` fires, even if a candidate
    ///   was found at the same moment.
    pub async fn resolve_peer(
        &self,
        expected: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredService, PairingError> {
        if self.discovery.is_none() && self.prober.is_none() {
            return Err(PairingError::DiscoveryUnavailable(
                "broadcast discovery disabled and no local IPv4 address for probing".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(PairingError::Cancelled);
        }

        let branch_cancel = cancel.child_token();
        let mut branches: FuturesUnordered<BoxFuture<'_, Option<DiscoveredService>>> =
            FuturesUnordered::new();
        if let Some(backend) = &self.discovery {
            branches.push(self.browse_branch(backend.as_ref(), expected).boxed());
        }
        if let Some((prober, local_ip)) = &self.prober {
            branches.push(probe_branch(prober, *local_ip, &branch_cancel).boxed());
        }

        info!(
            "resolving peer for {expected} (broadcast: {}, probe: {})",
            self.has_discovery(),
            self.has_prober()
        );

        // Owns the branches: they are dropped together with the select.
        let race = async move {
            while let Some(result) = branches.next().await {
                if result.is_some() {
                    return result;
                }
            }
            None
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PairingError::Cancelled),
            raced = tokio::time::timeout(self.discovery_timeout, race) => match raced {
                Ok(Some(found)) => Ok(found),
                Ok(None) => Err(PairingError::NotFound),
                Err(_) => Err(PairingError::DiscoveryTimeout(self.discovery_timeout)),
            },
        };

        branch_cancel.cancel();
        if let Some(backend) = &self.discovery {
            backend.stop_browsing().await;
        }

        // A cancel that raced the winning candidate still wins.
        if cancel.is_cancelled() {
            return Err(PairingError::Cancelled);
        }
        match &outcome {
            Ok(found) => info!("peer resolved at {} via {:?}", found.address, found.source),
            Err(e) => warn!("peer resolution failed: {e}"),
        }
        outcome
    }

    /// Browses until a record that may belong to `expected` arrives.
    async fn browse_branch(
        &self,
        backend: &dyn DiscoveryBackend,
        expected: &SessionId,
    ) -> Option<DiscoveredService> {
        let mut stream = match backend.browse(&self.service).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("broadcast browse unavailable: {e}");
                return None;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(service) if service.may_belong_to(expected) => return Some(service),
                Ok(service) => debug!(
                    "skipping {} at {}: session {:?} is not ours",
                    service.name, service.address, service.sid
                ),
                Err(e) => warn!("discovery backend error: {e}"),
            }
        }
        None
    }
}

async fn probe_branch(
    prober: &SubnetProber,
    local_ip: Ipv4Addr,
    cancel: &CancellationToken,
) -> Option<DiscoveredService> {
    match prober.probe(local_ip, cancel).await {
        ProbeOutcome::Found(addr) => Some(DiscoveredService::anonymous(
            addr,
            DiscoverySource::SubnetProbe,
        )),
        ProbeOutcome::NotFound | ProbeOutcome::Cancelled => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
