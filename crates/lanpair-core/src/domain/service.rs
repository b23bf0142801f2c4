//! Discovery-phase types: the advertised metadata record and discovered services.
//!
//! The metadata record is the only wire-visible key/value set in the system.
//! Its keys are fixed ([`TXT_SESSION_ID`], [`TXT_PUBLIC_KEY`],
//! [`TXT_PROTOCOL_VERSION`]) and every value is a string.
//!
//! Discovery is a hint, the handshake is the source of truth: a record whose
//! `sid` is missing or empty is still surfaced as [`SidHint::Missing`], and
//! identity is confirmed later during HELLO.  A `sid` that is present but not
//! a valid session code is kept as [`SidHint::Invalid`] and never matches.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{LocalIdentity, PeerAddress, PublicKey, SessionId};
use crate::protocol::messages::PROTOCOL_VERSION;

/// Record key carrying the session id.
pub const TXT_SESSION_ID: &str = "sid";
/// Record key carrying the base64 public key.
pub const TXT_PUBLIC_KEY: &str = "pk";
/// Record key carrying the protocol version.
pub const TXT_PROTOCOL_VERSION: &str = "v";

/// Default service name advertised by receivers.
pub const DEFAULT_SERVICE_NAME: &str = "_lanpair._ws";

/// String key/value record as carried by a discovery backend.
pub type TxtRecord = BTreeMap<String, String>;

/// Name a service is advertised and browsed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceName {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a record says about the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SidHint {
    /// No `sid`, or an empty one.  Identity is left to the handshake.
    Missing,
    Valid(SessionId),
    /// A `sid` that is not a session code, kept verbatim.
    Invalid(String),
}

impl SidHint {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => SidHint::Missing,
            Some(raw) => SessionId::new(raw)
                .map(SidHint::Valid)
                .unwrap_or_else(|_| SidHint::Invalid(raw.to_string())),
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            SidHint::Valid(sid) => Some(sid),
            SidHint::Missing | SidHint::Invalid(_) => None,
        }
    }

    /// `true` for a missing hint or an exact match.
    pub fn admits(&self, expected: &SessionId) -> bool {
        match self {
            SidHint::Missing => true,
            SidHint::Valid(sid) => sid == expected,
            SidHint::Invalid(_) => false,
        }
    }
}

impl From<SessionId> for SidHint {
    fn from(sid: SessionId) -> Self {
        SidHint::Valid(sid)
    }
}

/// Typed view of an advertised metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub sid: SidHint,
    pub public_key: Option<PublicKey>,
    /// Raw `v` value; kept as a string because the record is advisory.
    pub protocol_version: Option<String>,
}

impl ServiceMetadata {
    /// Metadata a Receiver advertises for `identity`.
    pub fn for_identity(identity: &LocalIdentity) -> Self {
        Self {
            sid: SidHint::Valid(identity.session_id.clone()),
            public_key: Some(identity.public_key()),
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
        }
    }

    pub fn to_txt(&self) -> TxtRecord {
        let mut txt = TxtRecord::new();
        match &self.sid {
            SidHint::Valid(sid) => {
                txt.insert(TXT_SESSION_ID.to_string(), sid.to_string());
            }
            SidHint::Invalid(raw) => {
                txt.insert(TXT_SESSION_ID.to_string(), raw.clone());
            }
            SidHint::Missing => {}
        }
        if let Some(pk) = &self.public_key {
            txt.insert(TXT_PUBLIC_KEY.to_string(), pk.to_base64());
        }
        if let Some(v) = &self.protocol_version {
            txt.insert(TXT_PROTOCOL_VERSION.to_string(), v.clone());
        }
        txt
    }

    /// Reads a record leniently: an unparsable key or version becomes `None`.
    pub fn from_txt(txt: &TxtRecord) -> Self {
        Self {
            sid: SidHint::from_raw(txt.get(TXT_SESSION_ID).map(String::as_str)),
            public_key: txt
                .get(TXT_PUBLIC_KEY)
                .and_then(|s| PublicKey::from_base64(s).ok()),
            protocol_version: txt
                .get(TXT_PROTOCOL_VERSION)
                .filter(|v| !v.is_empty())
                .cloned(),
        }
    }
}

/// Where a candidate address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Broadcast,
    SubnetProbe,
    Manual,
}

/// A candidate peer produced during the discovery phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub address: PeerAddress,
    pub sid: SidHint,
    pub public_key: Option<PublicKey>,
    pub source: DiscoverySource,
}

impl DiscoveredService {
    /// A bare address with no identity, as produced by the subnet prober or
    /// entered by hand.
    pub fn anonymous(address: PeerAddress, source: DiscoverySource) -> Self {
        Self {
            name: address.to_string(),
            address,
            sid: SidHint::Missing,
            public_key: None,
            source,
        }
    }

    /// The advertised session id, when the record carried a valid one.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.sid.session_id()
    }

    /// `false` when the record carries a `sid` other than `expected`,
    /// including one that is not a session code at all.  A missing id defers
    /// the decision to the handshake.
    pub fn may_belong_to(&self, expected: &SessionId) -> bool {
        self.sid.admits(expected)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
