//! Error types for the link layer and session core.
//!
//! Errors are split the way the specification's failure model is split:
//! [`StateError`] and [`PairingError`] are narrow types thrown only from the
//! state machine's `transition` and the pairing handler's request/response
//! paths respectively, while [`ProtocolError`] is the umbrella type the rest
//! of the crate (packet codec, discovery, transport, connection manager,
//! router, handlers) converges on via `?` and `#[from]`.

use thiserror::Error;

/// Result alias for umbrella protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from binding sockets, dialing peers, and transport timeouts.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to bind: {0}")]
    BindFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// The tag used in logs and tests, matching spec.md's `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkError::BindFailed(_) => "bind_failed",
            NetworkError::ConnectionFailed(_) => "connection_failed",
            NetworkError::Timeout(_) => "timeout",
            NetworkError::Io(_) => "connection_failed",
        }
    }
}

/// Errors thrown from the pairing handler's request/accept/reject paths.
///
/// Per spec.md §7, these are either surfaced to the caller of
/// `requestPairing` or delivered asynchronously via `onPairingResult(_, false)`
/// rather than propagated with `?` through the rest of the crate.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("device is already paired")]
    AlreadyPaired,

    #[error("connection has no peer certificate")]
    NoPeerCert,

    #[error("pairing request was rejected")]
    Rejected,

    #[error("pairing request timed out")]
    Timeout,
}

impl PairingError {
    pub fn kind(&self) -> &'static str {
        match self {
            PairingError::AlreadyPaired => "already_paired",
            PairingError::NoPeerCert => "no_peer_cert",
            PairingError::Rejected => "rejected",
            PairingError::Timeout => "timeout",
        }
    }
}

/// Thrown only from [`crate::state_machine::StateMachine::transition`] when
/// the requested transition is not in the allowed table. Never produced
/// silently — an illegal transition request is always an error, never a
/// no-op.
#[derive(Error, Debug)]
#[error("invalid transition: {from} -> {to}")]
pub struct StateError {
    pub from: String,
    pub to: String,
}

/// Umbrella error for packet parsing, identity validation, transport, and
/// orchestration failures. Everything that isn't one of the narrow error
/// types above converges here via `?`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    #[error("certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    #[error("pem error: {0}")]
    Pem(#[from] pem::PemError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    State(#[from] StateError),

    /// A packet failed codec-level validation: not an object, missing a
    /// numeric `id`, missing a string `type`, or a non-object `body`.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// An identity packet's body failed field validation (device id shape,
    /// device type, protocol version, or port range).
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The peer certificate's CN disagreed with the identity packet's
    /// `deviceId`, or the post-TLS identity disagreed with the pre-TLS one.
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device not paired: {0}")]
    NotPaired(String),
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::InvalidPacket(_) => "invalid_packet",
            ProtocolError::InvalidIdentity(_) => "invalid_identity",
            ProtocolError::VersionMismatch(_) => "version_mismatch",
            ProtocolError::Network(e) => e.kind(),
            ProtocolError::Pairing(e) => e.kind(),
            ProtocolError::State(_) => "invalid_transition",
            ProtocolError::DeviceNotFound(_) => "device_not_found",
            ProtocolError::NotPaired(_) => "not_paired",
            _ => "internal",
        }
    }

    /// Transient I/O and network failures are retried at the caller's
    /// discretion; they never bring the daemon down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Network(_) | ProtocolError::Io(_) | ProtocolError::Tls(_)
        )
    }
}
