//! Discovery adapter contract.
//!
//! A [`DiscoveryBackend`] advertises this device's presence and browses for
//! others.  The core only depends on this trait; which backend exists on a
//! host is decided once at startup and passed in explicitly as an
//! `Option<Arc<dyn DiscoveryBackend>>`.
//!
//! # Browse streams
//!
//! `browse` returns a [`DiscoveryStream`]: a bounded channel fed by a
//! background producer.  The consumer pulls with [`DiscoveryStream::next`] and
//! stops whenever it likes (first match, timeout, cancellation).  Dropping the
//! stream cancels the producer, which releases its socket.
//!
//! Backend errors are delivered as `Err` items rather than silently ending the
//! stream, so a consumer can always tell "nothing found yet" from "broken".
//!
//! # Sub-modules
//!
//! - **`udp`** – UDP broadcast query/announce backend.
//! - **`mock`** – In-memory backend for tests.

use async_trait::async_trait;
use lanpair_core::{DiscoveredService, ServiceName, TxtRecord};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod mock;
pub mod udp;

/// Capacity of the channel between a browse producer and its consumer.
pub const DISCOVERY_CHANNEL_CAPACITY: usize = 32;

/// Error type for discovery backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The backend cannot run on this host (e.g. broadcast sockets refused).
    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),

    /// The backend failed while running.
    #[error("discovery backend error: {0}")]
    Backend(String),
}

/// Item produced by a browse stream.
pub type DiscoveryItem = Result<DiscoveredService, DiscoveryError>;

/// Contract every discovery backend implements.
///
/// Advertising and browsing are each single-slot per instance: starting a new
/// one supersedes the previous one.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Starts (or replaces) the advertisement of `service` on `port`.
    async fn advertise(
        &self,
        service: &ServiceName,
        port: u16,
        metadata: &TxtRecord,
    ) -> Result<(), DiscoveryError>;

    /// Stops advertising.  Safe to call when nothing is advertised.
    async fn stop_advertising(&self);

    /// Starts (or replaces) browsing for `service`.
    async fn browse(&self, service: &ServiceName) -> Result<DiscoveryStream, DiscoveryError>;

    /// Stops browsing.  Safe to call when nothing is being browsed.
    async fn stop_browsing(&self);
}

/// Consumer half of a browse.
#[derive(Debug)]
pub struct DiscoveryStream {
    rx: mpsc::Receiver<DiscoveryItem>,
    cancel: CancellationToken,
}

/// Producer half of a browse.
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    tx: mpsc::Sender<DiscoveryItem>,
    cancel: CancellationToken,
}

/// Creates a connected sink/stream pair.
pub fn discovery_channel() -> (DiscoverySink, DiscoveryStream) {
    let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    (
        DiscoverySink {
            tx,
            cancel: cancel.clone(),
        },
        DiscoveryStream { rx, cancel },
    )
}

impl DiscoveryStream {
    /// Next discovered service or backend error; `None` once the producer stopped.
    pub async fn next(&mut self) -> Option<DiscoveryItem> {
        self.rx.recv().await
    }

    /// Stops the producer.  Items already buffered can still be read.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl DiscoverySink {
    /// Delivers an item, waiting for channel capacity.
    ///
    /// Returns `false` when the consumer is gone or the browse was cancelled;
    /// the producer should stop.
    pub async fn publish(&self, item: DiscoveryItem) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    /// Non-blocking variant of [`publish`](Self::publish); drops the item when
    /// the channel is full.
    pub fn try_publish(&self, item: DiscoveryItem) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        !matches!(self.tx.try_send(item), Err(mpsc::error::TrySendError::Closed(_)))
    }

    /// Resolves when the consumer cancels or drops the stream.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Cancels the browse from the producer side (used by `stop_browsing`).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanpair_core::{DiscoverySource, PeerAddress};

    fn service() -> DiscoveredService {
        let addr: PeerAddress = "192.168.1.10:24813".parse().unwrap();
        DiscoveredService::anonymous(addr, DiscoverySource::Broadcast)
    }

    #[tokio::test]
    async fn test_published_items_arrive_in_order() {
        // Arrange
        let (sink, mut stream) = discovery_channel();

        // Act
        assert!(sink.publish(Ok(service())).await);
        assert!(sink.publish(Err(DiscoveryError::Backend("boom".into()))).await);
        drop(sink);

        // Assert
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(matches!(stream.next().await, Some(Err(DiscoveryError::Backend(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        let (sink, stream) = discovery_channel();
        drop(stream);
        assert!(sink.is_cancelled());
        assert!(!sink.publish(Ok(service())).await);
    }

    #[test]
    fn test_next_is_pending_until_an_item_is_published() {
        // Arrange
        let (sink, mut stream) = discovery_channel();
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        // Act
        assert!(sink.try_publish(Ok(service())));

        // Assert
        assert!(next.is_woken());
        assert!(matches!(tokio_test::assert_ready!(next.poll()), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_try_publish_reports_cancellation() {
        let (sink, stream) = discovery_channel();
        stream.cancel();
        assert!(!sink.try_publish(Ok(service())));
    }
}
