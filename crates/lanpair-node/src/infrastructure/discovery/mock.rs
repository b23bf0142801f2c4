//! In-memory discovery backend for tests.
//!
//! Records what was advertised and lets a test inject services (or errors)
//! into the active browse.  Items injected before `browse` is called are
//! queued and delivered when browsing starts.

use std::sync::Mutex;

use async_trait::async_trait;
use lanpair_core::{DiscoveredService, ServiceName, TxtRecord};

use super::{
    discovery_channel, DiscoveryBackend, DiscoveryError, DiscoveryItem, DiscoverySink,
    DiscoveryStream,
};

/// A recorded `advertise` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service: ServiceName,
    pub port: u16,
    pub metadata: TxtRecord,
}

#[derive(Debug, Default)]
struct MockState {
    current: Option<Advertisement>,
    history: Vec<Advertisement>,
    browse: Option<DiscoverySink>,
    browse_count: usize,
    pending: Vec<DiscoveryItem>,
    fail_browse: Option<DiscoveryError>,
}

/// Test double implementing [`DiscoveryBackend`].
#[derive(Debug, Default)]
pub struct MockDiscovery {
    state: Mutex<MockState>,
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `service` to the current browse, or queues it for the next one.
    pub fn inject(&self, service: DiscoveredService) {
        self.inject_item(Ok(service));
    }

    /// Delivers a backend error to the current browse, or queues it.
    pub fn inject_error(&self, error: DiscoveryError) {
        self.inject_item(Err(error));
    }

    /// Makes the next `browse` call fail with `error`.
    pub fn fail_next_browse(&self, error: DiscoveryError) {
        self.lock().fail_browse = Some(error);
    }

    /// The advertisement currently active, if any.
    pub fn current_advertisement(&self) -> Option<Advertisement> {
        self.lock().current.clone()
    }

    /// Every `advertise` call, in order.
    pub fn advertisement_history(&self) -> Vec<Advertisement> {
        self.lock().history.clone()
    }

    /// `true` while a browse is running and its consumer is still listening.
    pub fn is_browsing(&self) -> bool {
        self.lock()
            .browse
            .as_ref()
            .is_some_and(|sink| !sink.is_cancelled())
    }

    pub fn browse_count(&self) -> usize {
        self.lock().browse_count
    }

    fn inject_item(&self, item: DiscoveryItem) {
        let mut state = self.lock();
        match state.browse.as_ref() {
            Some(sink) if !sink.is_cancelled() => {
                sink.try_publish(item);
            }
            _ => state.pending.push(item),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DiscoveryBackend for MockDiscovery {
    async fn advertise(
        &self,
        service: &ServiceName,
        port: u16,
        metadata: &TxtRecord,
    ) -> Result<(), DiscoveryError> {
        let ad = Advertisement {
            service: service.clone(),
            port,
            metadata: metadata.clone(),
        };
        let mut state = self.lock();
        state.history.push(ad.clone());
        state.current = Some(ad);
        Ok(())
    }

    async fn stop_advertising(&self) {
        self.lock().current = None;
    }

    async fn browse(&self, _service: &ServiceName) -> Result<DiscoveryStream, DiscoveryError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_browse.take() {
            return Err(err);
        }
        if let Some(old) = state.browse.take() {
            old.cancel();
        }
        let (sink, stream) = discovery_channel();
        for item in state.pending.drain(..) {
            sink.try_publish(item);
        }
        state.browse = Some(sink);
        state.browse_count += 1;
        Ok(stream)
    }

    async fn stop_browsing(&self) {
        if let Some(sink) = self.lock().browse.take() {
            sink.cancel();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanpair_core::{DiscoverySource, PeerAddress};

    fn service(last_octet: u8) -> DiscoveredService {
        let addr: PeerAddress = format!("10.0.0.{last_octet}:24813").parse().unwrap();
        DiscoveredService::anonymous(addr, DiscoverySource::Broadcast)
    }

    #[tokio::test]
    async fn test_queued_services_are_delivered_on_browse() {
        // Arrange
        let mock = MockDiscovery::new();
        mock.inject(service(5));

        // Act
        let mut stream = mock.browse(&ServiceName::default()).await.unwrap();
        mock.inject(service(6));

        // Assert
        assert_eq!(stream.next().await.unwrap().unwrap(), service(5));
        assert_eq!(stream.next().await.unwrap().unwrap(), service(6));
    }

    #[tokio::test]
    async fn test_advertise_records_and_stop_clears() {
        let mock = MockDiscovery::new();
        mock.advertise(&ServiceName::default(), 24813, &TxtRecord::new())
            .await
            .unwrap();
        assert_eq!(mock.current_advertisement().unwrap().port, 24813);

        mock.stop_advertising().await;
        assert!(mock.current_advertisement().is_none());
        assert_eq!(mock.advertisement_history().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_ends_browse() {
        let mock = MockDiscovery::new();
        let stream = mock.browse(&ServiceName::default()).await.unwrap();
        assert!(mock.is_browsing());
        drop(stream);
        assert!(!mock.is_browsing());
    }

    #[tokio::test]
    async fn test_fail_next_browse() {
        let mock = MockDiscovery::new();
        mock.fail_next_browse(DiscoveryError::Backend("down".into()));
        assert!(mock.browse(&ServiceName::default()).await.is_err());
        assert!(mock.browse(&ServiceName::default()).await.is_ok());
    }
}
