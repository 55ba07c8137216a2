//! Error types for confab
//!
//! The error taxonomy follows the propagation policy of the session layer:
//! transport and decode failures are handled locally by closing the offending
//! connection and updating presence, user-facing lookup failures are
//! recoverable, and only bind failures abort session startup.

use thiserror::Error;

/// Main error type for confab operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Transport-level errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session-level errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-level errors
///
/// These are handled locally by dropping the affected connection; only
/// `BindFailed` propagates out of `Session::start`.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the listening socket at session creation
    #[error("Failed to bind listener on {address}: {reason}")]
    BindFailed {
        /// Address the listener tried to bind
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// Failed to establish an outbound connection
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Address of the remote peer
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// Stream ended in the middle of a frame
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Stream closed cleanly, or an operation was attempted on a closed
    /// connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer did not complete the handshake within the deadline
    #[error("Handshake with {address} timed out")]
    HandshakeTimeout {
        /// Address of the remote peer
        address: String,
    },

    /// Failed to write a frame to the stream
    #[error("Failed to send message: {reason}")]
    SendFailed {
        /// Underlying failure description
        reason: String,
    },

    /// Failed to read a frame from the stream
    #[error("Failed to receive message: {reason}")]
    ReceiveFailed {
        /// Underlying failure description
        reason: String,
    },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Failed to serialize a message
    #[error("Failed to encode message: {reason}")]
    EncodeFailed {
        /// Underlying failure description
        reason: String,
    },

    /// Malformed bytes on the wire
    ///
    /// Includes unrecognized message types; the decoder never silently drops
    /// bytes it cannot interpret.
    #[error("Failed to decode message: {reason}")]
    DecodeFailed {
        /// Underlying failure description
        reason: String,
    },

    /// Frame exceeds the maximum allowed size
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Size of the offending frame
        size: usize,
        /// Maximum allowed frame size
        max: usize,
    },

    /// Username failed validation
    #[error("Invalid username: {reason}")]
    InvalidUsername {
        /// What the validation rejected
        reason: String,
    },

    /// Peer sent a well-formed message that violates the protocol state
    /// machine, e.g. a chat message where a handshake was expected
    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the state machine required
        expected: String,
        /// What actually arrived
        got: String,
    },
}

/// Session-level errors surfaced to the caller as recoverable failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The addressed peer has never been registered
    #[error("Unknown peer: {username}")]
    PeerUnknown {
        /// Username that failed the lookup
        username: String,
    },

    /// The addressed peer is registered but has no live connection
    #[error("Peer is offline: {username}")]
    PeerOffline {
        /// Username of the offline peer
        username: String,
    },

    /// The session has not been started or has already stopped
    #[error("Session is not running")]
    NotRunning,

    /// The session is already running
    #[error("Session is already running")]
    AlreadyRunning,
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is missing or empty
    #[error("Missing required configuration field: {field}")]
    MissingRequiredField {
        /// Name of the missing field
        field: String,
    },

    /// A configuration field holds an invalid value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ChatError>;
