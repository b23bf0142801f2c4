//! WebSocket transport built on `tokio-tungstenite`.
//!
//! The Receiver binds a [`WsListener`] and accepts exactly one peer; the
//! Sender dials with [`WsConnector`].  Every transport message is one binary
//! WebSocket frame.
//!
//! # Listener behaviour
//!
//! - The listening socket is bound with `SO_REUSEADDR` and retried a few times
//!   so that a port released by a previous session can be reused at once.
//! - Connections that never complete the WebSocket upgrade (for example the
//!   subnet prober's connect-and-drop probes) are skipped and the accept loop
//!   continues.
//! - Inbound frames larger than [`MAX_MESSAGE_SIZE`] are dropped.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lanpair_core::PeerAddress;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{error::ProtocolError as WsProtocolError, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acceptor, Connector, Transport, TransportError, MAX_MESSAGE_SIZE};

/// How long an accepted TCP connection may take to finish the upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A WebSocket connection used as a session transport.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    peer: SocketAddr,
}

impl<S> WsTransport<S> {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(Message::Binary(bytes))
            .await
            .map_err(map_ws_error)
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            let data = match self.stream.next().await? {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // ping/pong/raw frames are handled by tungstenite
                Err(e) if is_orderly_drop(&e) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };
            if data.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "dropping oversized message from {}: {} bytes",
                    self.peer,
                    data.len()
                );
                continue;
            }
            return Some(Ok(data));
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match SinkExt::close(&mut self.stream).await {
            Ok(()) => Ok(()),
            Err(e) if is_orderly_drop(&e) => Ok(()),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    fn peer(&self) -> Option<PeerAddress> {
        match self.peer {
            SocketAddr::V4(v4) => Some(PeerAddress::from(v4)),
            SocketAddr::V6(_) => None,
        }
    }
}

/// `true` for errors that mean "the peer went away" rather than a fault.
fn is_orderly_drop(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}

fn map_ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

// ── Listener (Receiver side) ──────────────────────────────────────────────────

/// Listening endpoint for the Receiver.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    /// Binds `addr`, retrying while a previous socket on the port lingers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] with the last bind error once all
    /// attempts are exhausted.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let mut last_err = String::new();
        for attempt in 0..BIND_ATTEMPTS {
            if attempt > 0 {
                sleep(BIND_RETRY_DELAY).await;
            }
            match try_bind(addr) {
                Ok(listener) => {
                    info!("transport listening on {}", listener.local_addr().unwrap_or(addr));
                    return Ok(Self { listener });
                }
                Err(e) => {
                    debug!("bind attempt {} on {addr} failed: {e}", attempt + 1);
                    last_err = format!("{addr}: {e}");
                }
            }
        }
        Err(TransportError::BindFailed(last_err))
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Waits for the first peer that completes a WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// [`TransportError::Cancelled`] when `cancel` fires, or
    /// [`TransportError::Io`] if the listening socket fails.
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WsTransport<TcpStream>, TransportError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                accepted = self.listener.accept() => {
                    accepted.map_err(|e| TransportError::Io(e.to_string()))?
                }
            };

            let upgrade = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                upgrade = timeout(UPGRADE_TIMEOUT, accept_async(stream)) => upgrade,
            };

            match upgrade {
                Ok(Ok(ws)) => {
                    info!("peer connected from {peer}");
                    return Ok(WsTransport { stream: ws, peer });
                }
                Ok(Err(e)) => debug!("connection from {peer} did not upgrade: {e}"),
                Err(_) => debug!("connection from {peer} timed out during upgrade"),
            }
        }
    }
}

#[async_trait]
impl Acceptor for WsListener {
    fn local_port(&self) -> Result<u16, TransportError> {
        Ok(self.local_addr()?.port())
    }

    async fn accept_transport(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.accept(cancel).await?))
    }
}

fn try_bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(128)
}

// ── Connector (Sender side) ───────────────────────────────────────────────────

/// Dials `ws://HOST:PORT/` on a resolved peer address.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, addr: PeerAddress) -> Result<Box<dyn Transport>, TransportError> {
        let url = format!("ws://{addr}/");
        let (stream, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                addr,
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| TransportError::ConnectFailed {
                addr,
                reason: e.to_string(),
            })?;
        info!("connected to {url}");
        let transport: WsTransport<MaybeTlsStream<TcpStream>> = WsTransport {
            stream,
            peer: SocketAddr::V4(addr.socket_addr()),
        };
        Ok(Box::new(transport))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn loopback_listener() -> (WsListener, PeerAddress) {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PeerAddress::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        // Arrange
        let (listener, addr) = loopback_listener().await;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { listener.accept(&cancel).await });

        // Act
        let mut client = WsConnector::default().connect(addr).await.unwrap();
        let mut server = server.await.unwrap().unwrap();
        client.send(b"hello".to_vec()).await.unwrap();
        server.send(b"world".to_vec()).await.unwrap();

        // Assert
        assert_eq!(server.recv().await.unwrap().unwrap(), b"hello".to_vec());
        assert_eq!(client.recv().await.unwrap().unwrap(), b"world".to_vec());
    }

    #[tokio::test]
    async fn test_close_is_seen_as_end_of_stream() {
        let (listener, addr) = loopback_listener().await;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { listener.accept(&cancel).await });
        let mut client = WsConnector::default().connect(addr).await.unwrap();
        let mut server = server.await.unwrap().unwrap();

        server.close().await.unwrap();

        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_accept_skips_connections_that_never_upgrade() {
        // Arrange: a raw TCP probe connects and immediately hangs up
        let (listener, addr) = loopback_listener().await;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { listener.accept(&cancel).await });
        drop(TcpStream::connect(SocketAddr::V4(addr.socket_addr())).await.unwrap());

        // Act
        let client = WsConnector::default().connect(addr).await;

        // Assert
        assert!(client.is_ok());
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_accept_returns_cancelled_when_token_fires() {
        let (listener, _addr) = loopback_listener().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(listener.accept(&cancel).await, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped() {
        let (listener, addr) = loopback_listener().await;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(async move { listener.accept(&cancel).await });
        let mut client = WsConnector::default().connect(addr).await.unwrap();
        let mut server = server.await.unwrap().unwrap();

        client.send(vec![0u8; MAX_MESSAGE_SIZE + 1]).await.unwrap();
        client.send(b"small".to_vec()).await.unwrap();

        assert_eq!(server.recv().await.unwrap().unwrap(), b"small".to_vec());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Bind then drop to find a port nobody listens on.
        let (listener, addr) = loopback_listener().await;
        drop(listener);

        let result = WsConnector::new(Duration::from_secs(2)).connect(addr).await;

        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }
}
