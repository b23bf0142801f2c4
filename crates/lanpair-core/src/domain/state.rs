//! Session lifecycle states and the table that governs transitions between them.
//!
//! ```text
//!            StartReceiver            PeerConnected           HandshakeSucceeded
//!   Idle ─────────────────► Advertising ─────────┐
//!     │                                          ├──► Pairing ───────────────────► Active ◄─┐
//!     └─────────────────► Browsing ──────────────┘       │                          │   │    │ DataReceived
//!            StartSender                                  │ HandshakeFailed          │   └────┘
//!                                                         ▼                          │
//!                                                      Closed ◄──────────────────────┘
//!                                                                   TransportClosed
//! ```
//!
//! `CloseRequested` and `Fatal` lead to `Closed` from every non-terminal
//! state.  `Closed` is absorbing: every trigger applied to it is refused with
//! [`StateError::Terminal`], which callers treat as "ignore".
//!
//! Transitions are looked up in [`TRANSITIONS`]; anything not listed there is
//! rejected with [`StateError::Illegal`] and leaves the state unchanged.

use std::fmt;

use thiserror::Error;
use tracing::trace;

use super::identity::Role;

/// Lifecycle state of one pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Advertising,
    Browsing,
    Pairing,
    Active,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Advertising => "advertising",
            SessionState::Browsing => "browsing",
            SessionState::Pairing => "pairing",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTrigger {
    StartReceiver,
    StartSender,
    /// A peer address was resolved and the transport connected.
    PeerConnected,
    /// Both HELLOs were sent and received and the peer's was valid.
    HandshakeSucceeded,
    /// Mismatch, malformed payload, timeout or drop during the handshake.
    HandshakeFailed,
    DataReceived,
    TransportClosed,
    CloseRequested,
    Fatal,
}

impl SessionTrigger {
    /// The trigger that starts a session playing `role`.
    pub fn start(role: Role) -> Self {
        match role {
            Role::Sender => SessionTrigger::StartSender,
            Role::Receiver => SessionTrigger::StartReceiver,
        }
    }
}

/// `(from, trigger, to)`; a `from` of `None` matches every non-terminal state.
pub type TransitionRule = (Option<SessionState>, SessionTrigger, SessionState);

/// The complete transition table.
pub const TRANSITIONS: &[TransitionRule] = &[
    (Some(SessionState::Idle), SessionTrigger::StartReceiver, SessionState::Advertising),
    (Some(SessionState::Idle), SessionTrigger::StartSender, SessionState::Browsing),
    (Some(SessionState::Advertising), SessionTrigger::PeerConnected, SessionState::Pairing),
    (Some(SessionState::Browsing), SessionTrigger::PeerConnected, SessionState::Pairing),
    (Some(SessionState::Pairing), SessionTrigger::HandshakeSucceeded, SessionState::Active),
    (Some(SessionState::Pairing), SessionTrigger::HandshakeFailed, SessionState::Closed),
    (Some(SessionState::Active), SessionTrigger::DataReceived, SessionState::Active),
    (Some(SessionState::Active), SessionTrigger::TransportClosed, SessionState::Closed),
    (None, SessionTrigger::CloseRequested, SessionState::Closed),
    (None, SessionTrigger::Fatal, SessionState::Closed),
];

/// Reasons a trigger was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StateError {
    /// The session already reached `Closed`; the trigger is ignored.
    #[error("session is closed; {trigger:?} ignored")]
    Terminal { trigger: SessionTrigger },

    /// No rule exists for this `(state, trigger)` pair.
    #[error("illegal transition: {trigger:?} in state {from}")]
    Illegal {
        from: SessionState,
        trigger: SessionTrigger,
    },
}

/// A transition that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: SessionTrigger,
}

/// Looks up the target state for `trigger` in `from` without mutating anything.
///
/// # Errors
///
/// Returns [`StateError::Terminal`] when `from` is `Closed` and
/// [`StateError::Illegal`] when the table has no matching rule.
pub fn next_state(from: SessionState, trigger: SessionTrigger) -> Result<SessionState, StateError> {
    if from.is_terminal() {
        return Err(StateError::Terminal { trigger });
    }
    TRANSITIONS
        .iter()
        .find(|(rule_from, rule_trigger, _)| {
            *rule_trigger == trigger && rule_from.map_or(true, |s| s == from)
        })
        .map(|(_, _, to)| *to)
        .ok_or(StateError::Illegal { from, trigger })
}

/// Owns the current state of one session and applies triggers against the table.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    /// Creates a machine in [`SessionState::Idle`].
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Applies `trigger` to the current state.
    ///
    /// On error the state is left untouched.
    ///
    /// # Errors
    ///
    /// See [`next_state`].
    pub fn apply(&mut self, trigger: SessionTrigger) -> Result<Transition, StateError> {
        let from = self.state;
        let to = next_state(from, trigger)?;
        self.state = to;
        trace!("{from} --{trigger:?}--> {to}");
        Ok(Transition { from, to, trigger })
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
