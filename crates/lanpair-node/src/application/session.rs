//! Session: the lifecycle of one pairing attempt and the connection it yields.
//!
//! # Two phases
//!
//! Before a transport exists the caller drives a [`Session`] directly:
//! [`Session::begin`] moves it from `Idle` to `Advertising` or `Browsing`, and
//! a failed or cancelled discovery ends it with [`Session::abandon`] or
//! [`Session::cancel`].
//!
//! [`Session::attach`] hands a connected transport over.  From then on the
//! session runs as an actor task that exclusively owns the transport and
//! handles commands, inbound frames and the handshake deadline one at a time
//! in a single `tokio::select!` loop.  The caller keeps a cloneable
//! [`SessionHandle`].
//!
//! # Handshake
//!
//! ```text
//! Sender                               Receiver
//!   │ ── HELLO(sid, pk, v) ───────────────► │ validate sid and version
//!   │ ◄────────────── HELLO(sid, pk, v) ── │ reply, then Active
//!   │ validate, then Active                 │
//! ```
//!
//! Any mismatch, malformed frame, drop or timeout before both HELLOs were
//! accepted ends the session with [`SessionEvent::PairingFailed`].  Failures
//! are never retried; a new attempt needs a new `Session`.
//!
//! # Termination
//!
//! Every session emits exactly one terminal event (`PairingFailed`, `Closed`
//! or `ErrorOccurred`) and closes its transport exactly once, whichever side
//! or trigger ends it.  Dropping every [`SessionHandle`] closes the session.
//!
//! The actor never blocks on the event channel.  Events wait in an internal
//! queue that is drained alongside commands, so an owner that stops reading
//! events can still close the session.  While that queue is full the actor
//! stops reading the transport.

use std::collections::VecDeque;
use std::time::Duration;

use lanpair_core::{
    accept_hello_frame, decode_frame, encode_frame, HandshakeFailure, LocalIdentity,
    PairingRequest, PeerAddress, PublicKey, Role, SessionId, SessionState, SessionTrigger,
    StateError, StateMachine, Transition, WireMessage,
};
use lanpair_core::protocol::HEADER_SIZE;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::infrastructure::transport::{Transport, TransportError, MAX_MESSAGE_SIZE};

/// Handshake budget used when none is configured.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest payload [`SessionHandle::send`] accepts; one data frame must fit a
/// transport message.
pub const MAX_DATA_PAYLOAD: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Per-session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time allowed between attaching the transport and reaching `Active`.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Notifications emitted to the owner of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transport was attached; the handshake starts.
    Connected { peer: Option<PeerAddress> },
    /// The handshake was rejected.  Terminal.
    PairingFailed(HandshakeFailure),
    /// Both HELLOs were exchanged and accepted.
    Active { peer_key: PublicKey },
    /// Application payload from the peer.
    DataReceived(Vec<u8>),
    /// The session ended normally (local close or peer drop).  Terminal.
    Closed,
    /// The session ended on an unexpected failure.  Terminal.
    ErrorOccurred(String),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::PairingFailed(_) | SessionEvent::Closed | SessionEvent::ErrorOccurred(_)
        )
    }
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not allowed in the current state.
    #[error(transparent)]
    State(#[from] StateError),

    /// Application data can only be sent once the session is `Active`.
    #[error("session is not active (state: {0})")]
    NotActive(SessionState),

    /// The session already ended.
    #[error("session is closed")]
    Closed,

    /// The payload does not fit in one data frame.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// The transport rejected a send.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ── Pre-connection phase ──────────────────────────────────────────────────────

/// A pairing attempt that has not been handed a transport yet.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    identity: LocalIdentity,
    config: SessionConfig,
    machine: StateMachine,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Creates an `Idle` session and the receiver its events are delivered on.
    pub fn new(
        identity: LocalIdentity,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let id = Uuid::new_v4();
        debug!(
            "session {id} created as {} for code {}",
            identity.role, identity.session_id
        );
        (
            Self {
                id,
                identity,
                config,
                machine: StateMachine::new(),
                events,
                state_tx,
            },
            events_rx,
        )
    }

    /// Unique id used to correlate log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn session_id(&self) -> &SessionId {
        &self.identity.session_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// `Idle` → `Advertising` (Receiver) or `Browsing` (Sender).
    ///
    /// # Errors
    ///
    /// [`SessionError::State`] if the session already started.
    pub fn begin(&mut self) -> Result<SessionState, SessionError> {
        let transition = self.apply(SessionTrigger::start(self.identity.role))?;
        info!("session {} started: {}", self.id, transition.to);
        Ok(transition.to)
    }

    /// Ends the session before a transport was attached because discovery or
    /// connecting failed.  Emits [`SessionEvent::ErrorOccurred`].
    pub async fn abandon(mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(e) = self.apply(SessionTrigger::Fatal) {
            debug!("session {} abandon: {e}", self.id);
            return;
        }
        warn!("session {} abandoned: {reason}", self.id);
        let _ = self.events.send(SessionEvent::ErrorOccurred(reason)).await;
    }

    /// Ends the session before a transport was attached at the caller's
    /// request.  Emits [`SessionEvent::Closed`].
    pub async fn cancel(mut self) {
        if self.apply(SessionTrigger::CloseRequested).is_err() {
            return;
        }
        info!("session {} cancelled", self.id);
        let _ = self.events.send(SessionEvent::Closed).await;
    }

    /// Hands a connected transport to the session and starts the handshake.
    ///
    /// Emits [`SessionEvent::Connected`] and spawns the session actor.
    ///
    /// # Errors
    ///
    /// [`SessionError::State`] when called before [`begin`](Self::begin).  The
    /// transport is closed and the session ends with
    /// [`SessionEvent::ErrorOccurred`].
    pub async fn attach<T>(mut self, mut transport: T) -> Result<SessionHandle, SessionError>
    where
        T: Transport + 'static,
    {
        if let Err(e) = self.apply(SessionTrigger::PeerConnected) {
            error!("session {} cannot attach a transport: {e}", self.id);
            if let Err(close_err) = transport.close().await {
                debug!("closing rejected transport failed: {close_err}");
            }
            // Fatal is legal from every non-terminal state.
            let _ = self.apply(SessionTrigger::Fatal);
            let _ = self
                .events
                .send(SessionEvent::ErrorOccurred(e.to_string()))
                .await;
            return Err(e.into());
        }

        let peer = transport.peer();
        let _ = self.events.send(SessionEvent::Connected { peer }).await;
        match peer {
            Some(addr) => info!("session {} connected to {addr}", self.id),
            None => info!("session {} connected", self.id),
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = SessionHandle {
            id: self.id,
            commands: commands_tx,
            state: self.state_tx.subscribe(),
        };

        let span = info_span!("session", id = %self.id, role = %self.identity.role);
        let actor = SessionActor {
            id: self.id,
            identity: self.identity,
            handshake_timeout: self.config.handshake_timeout,
            machine: self.machine,
            transport,
            events: self.events,
            state_tx: self.state_tx,
            commands: commands_rx,
            hello_sent: false,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run().instrument(span));

        Ok(handle)
    }

    fn apply(&mut self, trigger: SessionTrigger) -> Result<Transition, StateError> {
        let transition = self.machine.apply(trigger)?;
        self.state_tx.send_replace(transition.to);
        Ok(transition)
    }
}

// ── Connected phase ───────────────────────────────────────────────────────────

enum Command {
    Send(Vec<u8>, oneshot::Sender<Result<(), SessionError>>),
    Close,
}

/// Cloneable control handle for an attached session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(bytes, _) => write!(f, "Send({} bytes)", bytes.len()),
            Command::Close => f.write_str("Close"),
        }
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state as last published by the session.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Sends application data to the peer.
    ///
    /// # Errors
    ///
    /// [`SessionError::PayloadTooLarge`] above [`MAX_DATA_PAYLOAD`],
    /// [`SessionError::NotActive`] before the handshake completed,
    /// [`SessionError::Closed`] after the session ended, or the transport's
    /// send error (which also ends the session).
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        if bytes.len() > MAX_DATA_PAYLOAD {
            return Err(SessionError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_DATA_PAYLOAD,
            });
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::Closed);
        }
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(bytes, reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Closes the session and waits until it has fully ended.
    ///
    /// Safe to call any number of times, from any clone, in any state.
    pub async fn close(&self) {
        // A full command queue or a finished actor both mean the close is
        // already underway or done.
        let _ = self.commands.try_send(Command::Close);
        self.closed().await;
    }

    /// Resolves once the session reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the actor is gone, which only happens after `Closed`.
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// How the actor loop ended.
enum Exit {
    CloseRequested,
    PeerClosed,
    HandshakeFailed(HandshakeFailure),
    Fatal(String),
}

struct SessionActor<T> {
    id: Uuid,
    identity: LocalIdentity,
    handshake_timeout: Duration,
    machine: StateMachine,
    transport: T,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::Receiver<Command>,
    hello_sent: bool,
    /// Events not yet accepted by the event channel.
    pending: VecDeque<SessionEvent>,
}

impl<T: Transport> SessionActor<T> {
    async fn run(mut self) {
        let deadline = Instant::now() + self.handshake_timeout;

        let mut exit = None;
        if self.identity.role.initiates_handshake() {
            if let Err(e) = self.send_hello().await {
                debug!("initial HELLO failed: {e}");
                exit = Some(Exit::HandshakeFailed(HandshakeFailure::TransportClosed));
            }
        }

        let exit = match exit {
            Some(exit) => exit,
            None => self.event_loop(deadline).await,
        };
        self.finish(exit).await;
    }

    async fn event_loop(&mut self, deadline: Instant) -> Exit {
        loop {
            let pairing = self.machine.state() == SessionState::Pairing;
            let flushing = !self.pending.is_empty();
            let reading = self.pending.len() < EVENT_CHANNEL_CAPACITY;
            let events = self.events.clone();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Send(bytes, reply)) => {
                        if let Some(exit) = self.send_data(bytes, reply).await {
                            return exit;
                        }
                    }
                    Some(Command::Close) | None => return Exit::CloseRequested,
                },
                _ = sleep_until(deadline), if pairing => {
                    return Exit::HandshakeFailed(HandshakeFailure::Timeout(self.handshake_timeout));
                }
                permit = events.reserve(), if flushing => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.pending.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => {
                        debug!("event receiver dropped; discarding {} events", self.pending.len());
                        self.pending.clear();
                    }
                },
                frame = self.transport.recv(), if reading => match frame {
                    Some(Ok(bytes)) => {
                        if let Some(exit) = self.on_frame(bytes).await {
                            return exit;
                        }
                    }
                    Some(Err(e)) => return Exit::Fatal(e.to_string()),
                    None if pairing => {
                        return Exit::HandshakeFailed(HandshakeFailure::TransportClosed);
                    }
                    None => return Exit::PeerClosed,
                },
            }
        }
    }

    async fn on_frame(&mut self, bytes: Vec<u8>) -> Option<Exit> {
        match self.machine.state() {
            SessionState::Pairing => self.on_handshake_frame(&bytes).await,
            SessionState::Active => {
                match decode_frame(&bytes) {
                    Ok(WireMessage::Data(payload)) => {
                        if let Err(e) = self.apply(SessionTrigger::DataReceived) {
                            warn!("data frame refused: {e}");
                            return None;
                        }
                        self.emit(SessionEvent::DataReceived(payload));
                    }
                    Ok(WireMessage::Hello(_)) => warn!("HELLO received while active; dropped"),
                    Err(e) => warn!("malformed frame dropped: {e}"),
                }
                None
            }
            other => {
                warn!("frame received in state {other}; dropped");
                None
            }
        }
    }

    async fn on_handshake_frame(&mut self, bytes: &[u8]) -> Option<Exit> {
        let peer_key = match accept_hello_frame(&self.identity.session_id, bytes) {
            Ok(key) => key,
            Err(failure) => return Some(Exit::HandshakeFailed(failure)),
        };

        if !self.hello_sent {
            if let Err(e) = self.send_hello().await {
                debug!("HELLO reply failed: {e}");
                return Some(Exit::HandshakeFailed(HandshakeFailure::TransportClosed));
            }
        }

        if let Err(e) = self.apply(SessionTrigger::HandshakeSucceeded) {
            return Some(Exit::Fatal(e.to_string()));
        }
        info!("paired with {peer_key}");
        self.emit(SessionEvent::Active { peer_key });
        None
    }

    async fn send_data(
        &mut self,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    ) -> Option<Exit> {
        let state = self.machine.state();
        if state != SessionState::Active {
            let _ = reply.send(Err(SessionError::NotActive(state)));
            return None;
        }
        let frame = encode_frame(&WireMessage::Data(bytes));
        match self.transport.send(frame).await {
            Ok(()) => {
                let _ = reply.send(Ok(()));
                None
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = reply.send(Err(SessionError::Transport(e)));
                Some(Exit::Fatal(reason))
            }
        }
    }

    async fn send_hello(&mut self) -> Result<(), TransportError> {
        let request =
            PairingRequest::new(self.identity.session_id.clone(), self.identity.public_key());
        self.transport
            .send(encode_frame(&WireMessage::Hello(request)))
            .await?;
        self.hello_sent = true;
        debug!("HELLO sent");
        Ok(())
    }

    async fn finish(mut self, exit: Exit) {
        let (trigger, event) = match exit {
            Exit::CloseRequested => (SessionTrigger::CloseRequested, SessionEvent::Closed),
            Exit::PeerClosed => (SessionTrigger::TransportClosed, SessionEvent::Closed),
            Exit::HandshakeFailed(failure) => {
                warn!("pairing failed: {failure}");
                (
                    SessionTrigger::HandshakeFailed,
                    SessionEvent::PairingFailed(failure),
                )
            }
            Exit::Fatal(reason) => {
                error!("session failed: {reason}");
                (SessionTrigger::Fatal, SessionEvent::ErrorOccurred(reason))
            }
        };

        if let Err(e) = self.machine.apply(trigger) {
            // Only reachable if the loop exited twice; force the terminal state.
            error!("terminal transition refused: {e}");
            let _ = self.machine.apply(SessionTrigger::Fatal);
        }

        if let Err(e) = self.transport.close().await {
            debug!("transport close reported: {e}");
        }
        self.state_tx.send_replace(SessionState::Closed);
        info!("session {} closed", self.id);
        self.emit(event);

        // The session is already Closed; the owner may drain at leisure.
        while let Some(event) = self.pending.pop_front() {
            if self.events.send(event).await.is_err() {
                break;
            }
        }
    }

    fn apply(&mut self, trigger: SessionTrigger) -> Result<Transition, StateError> {
        let transition = self.machine.apply(trigger)?;
        if transition.from != transition.to {
            self.state_tx.send_replace(transition.to);
        }
        Ok(transition)
    }

    fn emit(&mut self, event: SessionEvent) {
        // The owner may have stopped listening; the session still runs to completion.
        if !self.events.is_closed() {
            self.pending.push_back(event);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
