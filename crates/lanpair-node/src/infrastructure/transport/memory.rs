//! In-process duplex transport.
//!
//! [`pair`] returns two connected ends.  Closing or dropping one end makes the
//! other end's `recv` return `None` once buffered messages are drained, which
//! is exactly how a remote close looks over a socket.
//!
//! Every end counts its own `close()` calls so tests can assert the session
//! closes its transport exactly once.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use lanpair_core::PeerAddress;
use tokio::sync::mpsc;

use tokio_util::sync::CancellationToken;

use super::{Acceptor, Connector, Transport, TransportError};

type Frame = Result<Vec<u8>, String>;

/// Shared count of `close()` calls on one [`MemoryTransport`].
#[derive(Debug, Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// One end of an in-memory duplex channel.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closes: CloseCounter,
}

/// Creates two connected ends.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
            closes: CloseCounter::default(),
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
            closes: CloseCounter::default(),
        },
    )
}

impl MemoryTransport {
    /// Handle for observing how many times this end was closed.
    pub fn close_counter(&self) -> CloseCounter {
        self.closes.clone()
    }

    /// Delivers a channel failure to the other end's next `recv`.
    pub fn fail_peer(&self, reason: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Ok(bytes)).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx
            .recv()
            .await
            .map(|frame| frame.map_err(TransportError::Io))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// [`Connector`] handing out pre-built transports by address.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    endpoints: Mutex<HashMap<PeerAddress, MemoryTransport>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `transport` the result of the next `connect(addr)`.
    pub fn register(&self, addr: PeerAddress, transport: MemoryTransport) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(addr, transport);
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: PeerAddress) -> Result<Box<dyn Transport>, TransportError> {
        let transport = self
            .endpoints
            .lock()
            .map_err(|_| TransportError::Io("memory connector lock poisoned".to_string()))?
            .remove(&addr);
        match transport {
            Some(t) => Ok(Box::new(t)),
            None => Err(TransportError::ConnectFailed {
                addr,
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// [`Acceptor`] yielding transports queued with [`offer`](Self::offer).
#[derive(Debug)]
pub struct MemoryAcceptor {
    port: u16,
    tx: mpsc::UnboundedSender<MemoryTransport>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryTransport>>,
}

impl MemoryAcceptor {
    pub fn new(port: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            port,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Queues `transport` as the next accepted peer.
    pub fn offer(&self, transport: MemoryTransport) {
        let _ = self.tx.send(transport);
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn local_port(&self) -> Result<u16, TransportError> {
        Ok(self.port)
    }

    async fn accept_transport(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            next = rx.recv() => match next {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(TransportError::Closed),
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
