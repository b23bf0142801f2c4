//! Transport adapter contract.
//!
//! A transport is an ordered, reliable, message-framed byte channel: one
//! [`Transport::send`] on one side yields one [`Transport::recv`] with the
//! same bytes on the other.  The session layer needs nothing more.
//!
//! # Sub-modules
//!
//! - **`ws`** – WebSocket transport over `tokio-tungstenite`: a single-peer
//!   listener for the Receiver and a [`Connector`] for the Sender.
//! - **`memory`** – In-process duplex pair used by tests and by embedders that
//!   run both peers in one process.

use async_trait::async_trait;
use lanpair_core::PeerAddress;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod ws;

/// Largest single message a transport delivers, session frame header included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: PeerAddress, reason: String },

    /// The listening endpoint could not be bound.
    #[error("failed to bind transport listener: {0}")]
    BindFailed(String),

    /// The channel failed after it was established.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// A send was attempted after the channel closed.
    #[error("transport is closed")]
    Closed,

    /// The operation was abandoned because its cancellation token fired.
    #[error("transport operation cancelled")]
    Cancelled,
}

/// A connected, message-framed byte channel exclusively owned by one session.
#[async_trait]
pub trait Transport: Send {
    /// Sends one message.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for the next message.
    ///
    /// Returns `None` once the channel is closed by either side and
    /// `Some(Err(_))` when the channel fails.  Must be cancellation safe: it is
    /// polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;

    /// Closes the channel.  The session calls this exactly once.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Remote IPv4 endpoint, when the transport has one.
    fn peer(&self) -> Option<PeerAddress> {
        None
    }
}

/// Opens a [`Transport`] to a resolved peer address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: PeerAddress) -> Result<Box<dyn Transport>, TransportError>;
}

/// Listening endpoint handing out one inbound [`Transport`] per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Port peers should dial; this is what gets advertised.
    fn local_port(&self) -> Result<u16, TransportError>;

    /// Waits for the next peer, or [`TransportError::Cancelled`].
    async fn accept_transport(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(bytes).await
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn peer(&self) -> Option<PeerAddress> {
        (**self).peer()
    }
}
