//! Subnet prober.
//!
//! Fallback for networks where broadcast discovery is filtered: every host of
//! the local /24 is dialled on the transport port at once, and the first one
//! that accepts a connection wins.
//!
//! # Concurrency
//!
//! All 254 attempts live in one [`FuturesUnordered`] polled by the calling
//! task.  Nothing is spawned, so the "found" latch has a single writer and
//! dropping the set (on a win, a cancel or a timeout) tears every pending
//! attempt down before `probe` returns.
//!
//! Cancellation is checked first on every wake-up (`biased` select) and once
//! more after a win, so a cancel that races a success always reports
//! [`ProbeOutcome::Cancelled`].

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use lanpair_core::PeerAddress;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Hosts probed per subnet: `.1` through `.254`.
pub const HOSTS_PER_SUBNET: u8 = 254;

/// Default per-host connect budget.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Result of a subnet probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(PeerAddress),
    NotFound,
    Cancelled,
}

/// Opens a throwaway connection to a candidate.
///
/// The connection itself is discarded; only reachability matters.
#[async_trait]
pub trait ProbeDialer: Send + Sync {
    async fn dial(&self, addr: PeerAddress) -> bool;
}

/// Plain TCP connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl ProbeDialer for TcpDialer {
    async fn dial(&self, addr: PeerAddress) -> bool {
        TcpStream::connect(addr.socket_addr()).await.is_ok()
    }
}

/// Dials every host of a /24 looking for a listener.
#[derive(Clone)]
pub struct SubnetProber {
    port: u16,
    per_host_timeout: Duration,
    dialer: Arc<dyn ProbeDialer>,
}

impl SubnetProber {
    pub fn new(port: u16, per_host_timeout: Duration) -> Self {
        Self::with_dialer(port, per_host_timeout, Arc::new(TcpDialer))
    }

    pub fn with_dialer(port: u16, per_host_timeout: Duration, dialer: Arc<dyn ProbeDialer>) -> Self {
        Self {
            port,
            per_host_timeout,
            dialer,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Probes `a.b.c.1` to `a.b.c.254`, where `a.b.c` are the first three
    /// octets of `local_ip`.
    ///
    /// The local host is probed like any other; a receiver is never running
    /// on the sender's own machine in practice, and excluding it would make
    /// same-host testing impossible.
    pub async fn probe(&self, local_ip: Ipv4Addr, cancel: &CancellationToken) -> ProbeOutcome {
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }

        let candidates = subnet_candidates(local_ip, self.port);
        info!(
            "probing {} hosts on {}.0/24 port {}",
            candidates.len(),
            subnet_prefix(local_ip),
            self.port
        );

        let mut attempts: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|addr| {
                let dialer = Arc::clone(&self.dialer);
                let budget = self.per_host_timeout;
                async move {
                    let reachable = tokio::time::timeout(budget, dialer.dial(addr))
                        .await
                        .unwrap_or(false);
                    (addr, reachable)
                }
            })
            .collect();

        let mut found = None;
        while found.is_none() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = attempts.next() => match next {
                    Some((addr, true)) => found = Some(addr),
                    Some((_, false)) => {}
                    None => break,
                },
            }
        }
        let remaining = attempts.len();
        drop(attempts);

        if cancel.is_cancelled() {
            debug!("probe cancelled ({remaining} attempts torn down)");
            return ProbeOutcome::Cancelled;
        }
        match found {
            Some(addr) => {
                info!("probe found listener at {addr} ({remaining} attempts torn down)");
                ProbeOutcome::Found(addr)
            }
            None => {
                debug!("probe exhausted the subnet without a listener");
                ProbeOutcome::NotFound
            }
        }
    }
}

impl std::fmt::Debug for SubnetProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetProber")
            .field("port", &self.port)
            .field("per_host_timeout", &self.per_host_timeout)
            .finish_non_exhaustive()
    }
}

/// Every host address of the /24 containing `local_ip`.
pub fn subnet_candidates(local_ip: Ipv4Addr, port: u16) -> Vec<PeerAddress> {
    let [a, b, c, _] = local_ip.octets();
    (1..=HOSTS_PER_SUBNET)
        .map(|d| PeerAddress::new(Ipv4Addr::new(a, b, c, d), port))
        .collect()
}

fn subnet_prefix(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{a}.{b}.{c}")
}

/// Address of the interface that would carry outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the OS to pick a
/// route.  Returns `None` when there is no route or the result is loopback.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts exactly one address; every other dial hangs until dropped.
    struct OneListener {
        target: PeerAddress,
        live: Arc<AtomicUsize>,
        started: AtomicUsize,
    }

    /// Decrements the live counter when an attempt future is dropped.
    struct LiveGuard(Arc<AtomicUsize>);

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProbeDialer for OneListener {
        async fn dial(&self, addr: PeerAddress) -> bool {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            let _guard = LiveGuard(Arc::clone(&self.live));
            if addr == self.target {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return true;
            }
            std::future::pending::<bool>().await
        }
    }

    fn one_listener(target: &str) -> (Arc<OneListener>, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(OneListener {
            target: target.parse().unwrap(),
            live: Arc::clone(&live),
            started: AtomicUsize::new(0),
        });
        (dialer, live)
    }

    #[test]
    fn test_subnet_candidates_cover_hosts_1_to_254() {
        // Act
        let hosts = subnet_candidates(Ipv4Addr::new(192, 168, 1, 37), 24813);

        // Assert
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0].to_string(), "192.168.1.1:24813");
        assert_eq!(hosts[253].to_string(), "192.168.1.254:24813");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_finds_single_listener_and_tears_down_the_rest() {
        // Arrange
        let (dialer, live) = one_listener("192.168.1.77:24813");
        let prober = SubnetProber::with_dialer(24813, DEFAULT_PROBE_TIMEOUT, dialer.clone());
        let cancel = CancellationToken::new();

        // Act
        let outcome = prober.probe(Ipv4Addr::new(192, 168, 1, 5), &cancel).await;

        // Assert
        assert_eq!(
            outcome,
            ProbeOutcome::Found("192.168.1.77:24813".parse().unwrap())
        );
        assert_eq!(dialer.started.load(Ordering::SeqCst), 254);
        assert_eq!(live.load(Ordering::SeqCst), 0, "all other attempts dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_not_found_when_every_host_times_out() {
        // Arrange: the target lies outside the probed subnet
        let (dialer, live) = one_listener("10.0.0.1:24813");
        let prober = SubnetProber::with_dialer(24813, Duration::from_millis(200), dialer);

        // Act
        let outcome = prober
            .probe(Ipv4Addr::new(192, 168, 1, 5), &CancellationToken::new())
            .await;

        // Assert
        assert_eq!(outcome, ProbeOutcome::NotFound);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_probe_wins_and_tears_down() {
        // Arrange
        let (dialer, live) = one_listener("192.168.1.77:24813");
        let prober = SubnetProber::with_dialer(24813, DEFAULT_PROBE_TIMEOUT, dialer);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        // Act
        let outcome = prober.probe(Ipv4Addr::new(192, 168, 1, 5), &cancel).await;

        // Assert
        assert_eq!(outcome, ProbeOutcome::Cancelled);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    /// Cancels the probe from inside the winning dial, so the success and the
    /// cancel land in the same poll.
    struct CancelOnAnswer {
        target: PeerAddress,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ProbeDialer for CancelOnAnswer {
        async fn dial(&self, addr: PeerAddress) -> bool {
            if addr != self.target {
                return std::future::pending::<bool>().await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.cancel.cancel();
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_racing_a_success_reports_cancelled() {
        // Arrange
        let cancel = CancellationToken::new();
        let dialer = Arc::new(CancelOnAnswer {
            target: "192.168.1.77:24813".parse().unwrap(),
            cancel: cancel.clone(),
        });
        let prober = SubnetProber::with_dialer(24813, DEFAULT_PROBE_TIMEOUT, dialer);

        // Act
        let outcome = prober.probe(Ipv4Addr::new(192, 168, 1, 5), &cancel).await;

        // Assert
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_skips_dialling() {
        let (dialer, _live) = one_listener("192.168.1.77:24813");
        let prober = SubnetProber::with_dialer(24813, DEFAULT_PROBE_TIMEOUT, dialer.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = prober.probe(Ipv4Addr::new(192, 168, 1, 5), &cancel).await;

        assert_eq!(outcome, ProbeOutcome::Cancelled);
        assert_eq!(dialer.started.load(Ordering::SeqCst), 0);
    }
}
