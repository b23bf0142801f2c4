//! Identity newtypes shared by discovery, the handshake and the session layer.
//!
//! Every raw string that crosses a trust boundary (a session code typed by a
//! user, a base64 key read from a discovery record, a host string from a
//! datagram) is validated once, here, and carried as a distinct type from then
//! on.  A `SessionId` can never be passed where a `PeerAddress` is expected.
//!
//! # Session codes
//!
//! A session code is [`SESSION_CODE_LEN`] characters drawn from `A-Z0-9`.  The
//! Receiver generates one per pairing attempt and displays it; the Sender
//! either finds it in a discovery record or has the user type it in.
//!
//! # Key material
//!
//! Each side generates a fresh Ed25519 [`KeyPair`] per session.  Only the
//! public half travels: base64-encoded in discovery metadata and in the HELLO
//! payload.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of characters in a human-facing session code.
pub const SESSION_CODE_LEN: usize = 6;

/// Alphabet session codes are drawn from.
const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Errors raised when constructing identity values from untrusted input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The session code has the wrong length or contains characters outside `A-Z0-9`.
    #[error("invalid session code {0:?}: expected {SESSION_CODE_LEN} characters of A-Z or 0-9")]
    InvalidSessionCode(String),

    /// The public key is not valid base64.
    #[error("public key is not valid base64: {0}")]
    InvalidBase64(String),

    /// The decoded key has the wrong length or is not a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The host is not a usable dotted IPv4 address.
    #[error("unusable peer host {0:?}: expected a dotted IPv4 address")]
    InvalidHost(String),

    /// The address string could not be split into host and port.
    #[error("invalid peer address {0:?}: expected HOST:PORT")]
    InvalidAddress(String),
}

// ── SessionId ─────────────────────────────────────────────────────────────────

/// Identifier of one pairing attempt, displayed to users as a short code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a new random session code using the OS random source.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let code = (0..SESSION_CODE_LEN)
            .map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Validates a session code exactly as received on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSessionCode`] unless `code` is exactly
    /// [`SESSION_CODE_LEN`] uppercase alphanumeric ASCII characters.
    pub fn new(code: impl Into<String>) -> Result<Self, IdentityError> {
        let code = code.into();
        let valid = code.len() == SESSION_CODE_LEN
            && code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(code))
        } else {
            Err(IdentityError::InvalidSessionCode(code))
        }
    }

    /// Parses a code typed by a user: surrounding whitespace is trimmed and
    /// letters are upper-cased before validation.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSessionCode`] if the normalised input is
    /// still not a valid code.
    pub fn from_user_input(input: &str) -> Result<Self, IdentityError> {
        Self::new(input.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

// ── Role ──────────────────────────────────────────────────────────────────────

/// Which side of a pairing this process plays.  Fixed for a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Browses/probes for the peer, connects, and sends the first HELLO.
    Sender,
    /// Advertises, listens, and answers the Sender's HELLO.
    Receiver,
}

impl Role {
    /// `true` for the side that sends the first HELLO.
    pub fn initiates_handshake(self) -> bool {
        matches!(self, Role::Sender)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

// ── Key material ──────────────────────────────────────────────────────────────

/// Public half of a session key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Wraps raw key bytes after checking they form a valid Ed25519 point.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidPublicKey`] for bytes that do not
    /// decompress to a curve point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Result<Self, IdentityError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Decodes a standard-alphabet base64 key as carried in `pk` records.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidBase64`] or [`IdentityError::InvalidPublicKey`].
    pub fn from_base64(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| IdentityError::InvalidBase64(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Self::from_bytes(bytes)
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Per-session Ed25519 key pair.  The secret half never leaves this struct.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

// ── PeerAddress ───────────────────────────────────────────────────────────────

/// A candidate network address for the peer's transport endpoint.
///
/// Only IPv4 is representable; see [`parse_usable_host`] for the filter
/// applied to hosts learned from discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(SocketAddrV4);

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    /// Builds an address from a host string learned from discovery.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidHost`] if `host` is not a usable dotted
    /// IPv4 address.
    pub fn from_host(host: &str, port: u16) -> Result<Self, IdentityError> {
        parse_usable_host(host)
            .map(|ip| Self::new(ip, port))
            .ok_or_else(|| IdentityError::InvalidHost(host.to_string()))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        self.0
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerAddress {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| IdentityError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| IdentityError::InvalidAddress(s.to_string()))?;
        Self::from_host(host, port)
    }
}

/// Returns the IPv4 address for `host` if it is a usable dotted quad.
///
/// Hosts without a dot (hostnames, IPv6 literals, empty strings), the
/// unspecified address and the broadcast address are rejected.
pub fn parse_usable_host(host: &str) -> Option<Ipv4Addr> {
    let host = host.trim();
    if !host.contains('.') {
        return None;
    }
    let ip: Ipv4Addr = host.parse().ok()?;
    if ip.is_unspecified() || ip.is_broadcast() {
        return None;
    }
    Some(ip)
}

// ── LocalIdentity ─────────────────────────────────────────────────────────────

/// Everything a session needs to know about itself before it connects.
#[derive(Debug)]
pub struct LocalIdentity {
    pub role: Role,
    pub session_id: SessionId,
    pub key_pair: KeyPair,
}

impl LocalIdentity {
    /// Creates an identity with a freshly generated key pair.
    pub fn new(role: Role, session_id: SessionId) -> Self {
        Self {
            role,
            session_id,
            key_pair: KeyPair::generate(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
