//! Integration tests for two sessions talking over an in-memory transport.
//!
//! Each test builds a Receiver and a Sender, attaches them to the two ends of
//! a `memory::pair()`, and observes the public event stream only.

use std::time::Duration;

use lanpair_core::{LocalIdentity, Role, SessionId, SessionState};
use lanpair_core::HandshakeFailure;
use lanpair_node::application::{Session, SessionConfig, SessionEvent, SessionHandle};
use lanpair_node::infrastructure::transport::memory::pair;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Side {
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    public_key: lanpair_core::PublicKey,
}

fn new_session(role: Role, code: &str) -> (Session, mpsc::Receiver<SessionEvent>) {
    let identity = LocalIdentity::new(role, SessionId::new(code).unwrap());
    let (mut session, events) = Session::new(identity, SessionConfig::default());
    session.begin().unwrap();
    (session, events)
}

/// Connects a Receiver using `receiver_code` to a Sender using `sender_code`.
/// `sender_first` controls which side is attached first.
async fn connect(receiver_code: &str, sender_code: &str, sender_first: bool) -> (Side, Side) {
    let (receiver, receiver_events) = new_session(Role::Receiver, receiver_code);
    let (sender, sender_events) = new_session(Role::Sender, sender_code);
    let receiver_key = receiver.public_key();
    let sender_key = sender.public_key();
    let (a, b) = pair();

    let (receiver_handle, sender_handle) = if sender_first {
        let s = sender.attach(b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let r = receiver.attach(a).await.unwrap();
        (r, s)
    } else {
        let r = receiver.attach(a).await.unwrap();
        let s = sender.attach(b).await.unwrap();
        (r, s)
    };

    (
        Side {
            handle: receiver_handle,
            events: receiver_events,
            public_key: receiver_key,
        },
        Side {
            handle: sender_handle,
            events: sender_events,
            public_key: sender_key,
        },
    )
}

/// Next event that is not `Connected`.
async fn next_event(side: &mut Side) -> Option<SessionEvent> {
    loop {
        match timeout(WAIT, side.events.recv()).await.expect("event within timeout") {
            Some(SessionEvent::Connected { .. }) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_matching_codes_converge_to_active_in_either_attach_order() {
    for sender_first in [false, true] {
        // Arrange / Act
        let (mut receiver, mut sender) = connect("ABC123", "ABC123", sender_first).await;

        // Assert: each side learned the other's key
        assert_eq!(
            next_event(&mut receiver).await,
            Some(SessionEvent::Active {
                peer_key: sender.public_key
            })
        );
        assert_eq!(
            next_event(&mut sender).await,
            Some(SessionEvent::Active {
                peer_key: receiver.public_key
            })
        );
        assert_eq!(receiver.handle.state(), SessionState::Active);
        assert_eq!(sender.handle.state(), SessionState::Active);
    }
}

#[tokio::test]
async fn test_data_flows_both_ways_once_active() {
    // Arrange
    let (mut receiver, mut sender) = connect("K7Q2ZD", "K7Q2ZD", false).await;
    assert!(matches!(next_event(&mut receiver).await, Some(SessionEvent::Active { .. })));
    assert!(matches!(next_event(&mut sender).await, Some(SessionEvent::Active { .. })));

    // Act
    sender.handle.send(b"hello receiver".to_vec()).await.unwrap();
    receiver.handle.send(b"hello sender".to_vec()).await.unwrap();

    // Assert
    assert_eq!(
        next_event(&mut receiver).await,
        Some(SessionEvent::DataReceived(b"hello receiver".to_vec()))
    );
    assert_eq!(
        next_event(&mut sender).await,
        Some(SessionEvent::DataReceived(b"hello sender".to_vec()))
    );
}

#[tokio::test]
async fn test_mismatched_codes_never_reach_active() {
    // Arrange / Act
    let (mut receiver, mut sender) = connect("ABC123", "XYZ789", false).await;

    // Assert
    assert!(matches!(
        next_event(&mut receiver).await,
        Some(SessionEvent::PairingFailed(HandshakeFailure::SessionMismatch { .. }))
    ));
    assert_eq!(
        next_event(&mut sender).await,
        Some(SessionEvent::PairingFailed(HandshakeFailure::TransportClosed))
    );
    assert!(next_event(&mut receiver).await.is_none());
    assert!(next_event(&mut sender).await.is_none());
    assert_eq!(receiver.handle.state(), SessionState::Closed);
    assert_eq!(sender.handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_closing_one_side_closes_the_other() {
    // Arrange
    let (mut receiver, mut sender) = connect("ABC123", "ABC123", false).await;
    assert!(matches!(next_event(&mut receiver).await, Some(SessionEvent::Active { .. })));
    assert!(matches!(next_event(&mut sender).await, Some(SessionEvent::Active { .. })));

    // Act
    receiver.handle.close().await;
    receiver.handle.close().await;

    // Assert
    assert_eq!(next_event(&mut receiver).await, Some(SessionEvent::Closed));
    assert!(next_event(&mut receiver).await.is_none());
    assert_eq!(next_event(&mut sender).await, Some(SessionEvent::Closed));
    sender.handle.closed().await;
}

#[tokio::test]
async fn test_dropping_every_handle_closes_the_session() {
    // Arrange
    let (receiver, mut sender) = connect("ABC123", "ABC123", false).await;
    let Side { handle, mut events, .. } = receiver;
    assert!(matches!(next_event(&mut sender).await, Some(SessionEvent::Active { .. })));

    // Act
    drop(handle);

    // Assert
    let mut last = None;
    while let Some(event) = timeout(WAIT, events.recv()).await.unwrap() {
        last = Some(event);
    }
    assert_eq!(last, Some(SessionEvent::Closed));
    assert_eq!(next_event(&mut sender).await, Some(SessionEvent::Closed));
}
