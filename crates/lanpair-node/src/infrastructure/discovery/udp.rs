//! UDP broadcast discovery backend.
//!
//! # How it works
//!
//! The advertiser binds the discovery port and waits for `query` datagrams.
//! When a query names the advertised service it replies, by unicast to the
//! query's source, with an `announce` datagram carrying the transport port,
//! the advertiser's LAN address and the TXT metadata.
//!
//! The browser binds an ephemeral port, broadcasts a `query` every
//! `query_interval`, and turns each matching `announce` into a
//! [`DiscoveredService`].  Repeated answers from the same advertiser are
//! surfaced once.
//!
//! Datagrams are small JSON documents:
//!
//! ```text
//! {"kind":"query","service":"_lanpair._ws"}
//! {"kind":"announce","service":"_lanpair._ws","port":24813,
//!  "host":"192.168.1.20","txt":{"sid":"ABC123","pk":"...","v":"1"}}
//! ```
//!
//! # Address filtering
//!
//! Only dotted IPv4 hosts are surfaced.  An announce that names a host which
//! is not a usable IPv4 address (a hostname, an IPv6 literal, `0.0.0.0`) is
//! dropped.  When the announce carries no host, the datagram's source address
//! is used, subject to the same filter.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use lanpair_core::{
    parse_usable_host, DiscoveredService, DiscoverySource, PeerAddress, ServiceMetadata,
    ServiceName, SidHint, TxtRecord,
};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{discovery_channel, DiscoveryBackend, DiscoveryError, DiscoverySink, DiscoveryStream};
use crate::infrastructure::probe::local_ipv4;

/// Largest datagram the backend reads.
const MAX_DATAGRAM: usize = 4096;

/// Settings for [`UdpBroadcastDiscovery`].
#[derive(Debug, Clone)]
pub struct UdpDiscoveryConfig {
    /// Port the advertiser listens on and the browser queries.
    pub discovery_port: u16,
    /// Local interface to bind.
    pub bind_address: Ipv4Addr,
    /// Destination of query datagrams (normally the limited broadcast address).
    pub broadcast_address: Ipv4Addr,
    /// Delay between repeated queries while browsing.
    pub query_interval: Duration,
    /// Host to put in announcements.  Detected from the routing table when `None`.
    pub advertised_host: Option<Ipv4Addr>,
}

impl Default for UdpDiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_port: 24812,
            bind_address: Ipv4Addr::UNSPECIFIED,
            broadcast_address: Ipv4Addr::BROADCAST,
            query_interval: Duration::from_millis(1000),
            advertised_host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Datagram {
    Query {
        service: String,
    },
    Announce {
        service: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default)]
        txt: TxtRecord,
    },
}

impl Datagram {
    fn encode(&self) -> Vec<u8> {
        // Serializing a plain enum of strings and maps cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// A running advertiser or browser task.
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("discovery task ended abnormally: {e}");
        }
    }
}

/// Discovery over UDP broadcast on the local segment.
pub struct UdpBroadcastDiscovery {
    config: UdpDiscoveryConfig,
    advertiser: Mutex<Option<Worker>>,
    browser: Mutex<Option<(Worker, DiscoverySink)>>,
}

impl UdpBroadcastDiscovery {
    /// Checks that this host can open broadcast-capable UDP sockets.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] if it cannot; callers then run
    /// with no discovery backend rather than a degraded one.
    pub async fn bind(config: UdpDiscoveryConfig) -> Result<Self, DiscoveryError> {
        let probe = UdpSocket::bind(SocketAddrV4::new(config.bind_address, 0))
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("cannot open UDP socket: {e}")))?;
        probe
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Unavailable(format!("broadcast not permitted: {e}")))?;
        drop(probe);

        Ok(Self {
            config,
            advertiser: Mutex::new(None),
            browser: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &UdpDiscoveryConfig {
        &self.config
    }
}

#[async_trait]
impl DiscoveryBackend for UdpBroadcastDiscovery {
    async fn advertise(
        &self,
        service: &ServiceName,
        port: u16,
        metadata: &TxtRecord,
    ) -> Result<(), DiscoveryError> {
        // The slot stays locked until the replacement is stored, so a
        // concurrent call cannot slip a worker in between.
        let mut slot = self.advertiser.lock().await;
        if let Some(worker) = slot.take() {
            worker.stop().await;
            debug!("previous advertisement replaced");
        }

        let addr = SocketAddrV4::new(self.config.bind_address, self.config.discovery_port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DiscoveryError::Backend(format!("failed to bind {addr}: {e}")))?;

        let host = self.config.advertised_host.or_else(local_ipv4);
        let announce = Datagram::Announce {
            service: service.as_str().to_string(),
            port,
            host: host.map(|ip| ip.to_string()),
            txt: metadata.clone(),
        }
        .encode();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(advertise_loop(
            socket,
            service.as_str().to_string(),
            announce,
            cancel.clone(),
        ));
        info!("advertising {service} on UDP {addr} (transport port {port})");

        *slot = Some(Worker { cancel, handle });
        Ok(())
    }

    async fn stop_advertising(&self) {
        let worker = self.advertiser.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
            debug!("advertisement stopped");
        }
    }

    async fn browse(&self, service: &ServiceName) -> Result<DiscoveryStream, DiscoveryError> {
        let mut slot = self.browser.lock().await;
        if let Some((worker, sink)) = slot.take() {
            sink.cancel();
            worker.stop().await;
            debug!("previous browse replaced");
        }

        let socket = UdpSocket::bind(SocketAddrV4::new(self.config.bind_address, 0))
            .await
            .map_err(|e| DiscoveryError::Backend(format!("failed to bind browse socket: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Backend(format!("broadcast not permitted: {e}")))?;

        let (sink, stream) = discovery_channel();
        let cancel = CancellationToken::new();
        let target = SocketAddr::V4(SocketAddrV4::new(
            self.config.broadcast_address,
            self.config.discovery_port,
        ));
        let handle = tokio::spawn(browse_loop(
            socket,
            service.as_str().to_string(),
            target,
            self.config.query_interval,
            sink.clone(),
            cancel.clone(),
        ));
        info!("browsing for {service} via {target}");

        *slot = Some((Worker { cancel, handle }, sink));
        Ok(stream)
    }

    async fn stop_browsing(&self) {
        let slot = self.browser.lock().await.take();
        if let Some((worker, sink)) = slot {
            sink.cancel();
            worker.stop().await;
            debug!("browse stopped");
        }
    }
}

impl Drop for UdpBroadcastDiscovery {
    fn drop(&mut self) {
        if let Some(worker) = self.advertiser.get_mut().take() {
            worker.cancel.cancel();
        }
        if let Some((worker, sink)) = self.browser.get_mut().take() {
            sink.cancel();
            worker.cancel.cancel();
        }
    }
}

async fn advertise_loop(
    socket: UdpSocket,
    service: String,
    announce: Vec<u8>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("advertiser recv error: {e}");
                    continue;
                }
            },
        };

        match Datagram::decode(&buf[..len]) {
            Some(Datagram::Query { service: wanted }) if wanted == service => {
                debug!("query from {src}, answering");
                if let Err(e) = socket.send_to(&announce, src).await {
                    warn!("failed to answer query from {src}: {e}");
                }
            }
            Some(_) => {}
            None => debug!("ignoring malformed datagram from {src}"),
        }
    }
}

async fn browse_loop(
    socket: UdpSocket,
    service: String,
    target: SocketAddr,
    query_interval: Duration,
    sink: DiscoverySink,
    cancel: CancellationToken,
) {
    let query = Datagram::Query {
        service: service.clone(),
    }
    .encode();
    let mut ticker = tokio::time::interval(query_interval);
    let mut seen: HashSet<(PeerAddress, SidHint)> = HashSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sink.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&query, target).await {
                    let err = DiscoveryError::Backend(format!("query to {target} failed: {e}"));
                    if !sink.publish(Err(err)).await {
                        break;
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        let err = DiscoveryError::Backend(format!("browse recv failed: {e}"));
                        if !sink.publish(Err(err)).await {
                            break;
                        }
                        continue;
                    }
                };
                let Some(found) = service_from_datagram(&service, &buf[..len], src) else {
                    continue;
                };
                if !seen.insert((found.address, found.sid.clone())) {
                    continue;
                }
                debug!("discovered {} at {}", found.name, found.address);
                if !sink.publish(Ok(found)).await {
                    break;
                }
            }
        }
    }
    debug!("browse loop for {service} ended");
}

/// Turns a received datagram into a service record, or `None` when it is not
/// a usable announcement of `service`.
fn service_from_datagram(service: &str, bytes: &[u8], src: SocketAddr) -> Option<DiscoveredService> {
    let (port, host, txt) = match Datagram::decode(bytes) {
        Some(Datagram::Announce {
            service: name,
            port,
            host,
            txt,
        }) if name == service => (port, host, txt),
        Some(_) => return None,
        None => {
            debug!("ignoring malformed datagram from {src}");
            return None;
        }
    };

    let Some(address) = resolve_announce(host.as_deref(), src, port) else {
        debug!("discarding announce from {src} without a usable IPv4 host ({host:?})");
        return None;
    };

    let metadata = ServiceMetadata::from_txt(&txt);
    Some(DiscoveredService {
        name: service.to_string(),
        address,
        sid: metadata.sid,
        public_key: metadata.public_key,
        source: DiscoverySource::Broadcast,
    })
}

/// Picks the address to dial for an announcement.
fn resolve_announce(host: Option<&str>, src: SocketAddr, port: u16) -> Option<PeerAddress> {
    let ip = match host {
        Some(host) => parse_usable_host(host)?,
        None => match src.ip() {
            IpAddr::V4(ip) => parse_usable_host(&ip.to_string())?,
            IpAddr::V6(_) => return None,
        },
    };
    Some(PeerAddress::new(ip, port))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanpair_core::{LocalIdentity, Role, SessionId};

    fn src() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn test_datagram_wire_format_is_tagged_json() {
        let bytes = Datagram::Query {
            service: "_lanpair._ws".into(),
        }
        .encode();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"kind":"query","service":"_lanpair._ws"}"#
        );
    }

    #[test]
    fn test_resolve_announce_prefers_announced_host() {
        let addr = resolve_announce(Some("192.168.1.30"), src(), 24813).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.30:24813");
    }

    #[test]
    fn test_resolve_announce_falls_back_to_source() {
        let addr = resolve_announce(None, src(), 24813).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.20:24813");
    }

    #[test]
    fn test_resolve_announce_rejects_non_dotted_hosts() {
        assert!(resolve_announce(Some("my-laptop.local"), src(), 1).is_none());
        assert!(resolve_announce(Some("fe80::1"), src(), 1).is_none());
        assert!(resolve_announce(Some("0.0.0.0"), src(), 1).is_none());
        assert!(resolve_announce(None, "[fe80::1]:5000".parse().unwrap(), 1).is_none());
    }

    #[test]
    fn test_service_from_datagram_reads_metadata() {
        // Arrange
        let identity = LocalIdentity::new(Role::Receiver, SessionId::new("ABC123").unwrap());
        let txt = ServiceMetadata::for_identity(&identity).to_txt();
        let bytes = Datagram::Announce {
            service: "_lanpair._ws".into(),
            port: 24813,
            host: Some("192.168.1.30".into()),
            txt,
        }
        .encode();

        // Act
        let found = service_from_datagram("_lanpair._ws", &bytes, src()).unwrap();

        // Assert
        assert_eq!(found.session_id().map(|s| s.as_str()), Some("ABC123"));
        assert_eq!(found.public_key, Some(identity.public_key()));
        assert_eq!(found.source, DiscoverySource::Broadcast);
    }

    #[test]
    fn test_service_from_datagram_ignores_other_services_and_garbage() {
        let other = Datagram::Announce {
            service: "_other._tcp".into(),
            port: 1,
            host: None,
            txt: TxtRecord::new(),
        }
        .encode();
        assert!(service_from_datagram("_lanpair._ws", &other, src()).is_none());
        assert!(service_from_datagram("_lanpair._ws", b"\x00\x01garbage", src()).is_none());
    }

    #[tokio::test]
    async fn test_stop_operations_are_safe_when_idle() {
        let backend = UdpBroadcastDiscovery::bind(UdpDiscoveryConfig {
            bind_address: Ipv4Addr::LOCALHOST,
            ..UdpDiscoveryConfig::default()
        })
        .await
        .unwrap();
        backend.stop_advertising().await;
        backend.stop_browsing().await;
    }
}
