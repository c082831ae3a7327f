//! # Error Types
//!
//! Error handling for the protocol engine.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants fall into five families which decide what the
//! connection does next:
//!
//! - **Transport**: connect/read/write failures. The session reconnects.
//! - **Handshake**: bad crypto result or malformed handshake message. The attempt
//!   is abandoned and the session reconnects with backoff.
//! - **Decode**: unknown type, checksum mismatch, truncated buffer. The offending
//!   message is dropped and the connection continues.
//! - **Job**: timeouts and remote failures resolve only the affected job.
//! - **Authentication**: an IV/HMAC mismatch on decrypt. The connection is torn
//!   down.
//!
//! ## Example Usage
//! ```rust
//! use cm_protocol::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn parse_len(buf: &[u8]) -> Result<u32> {
//!     let raw: [u8; 4] = buf
//!         .get(..4)
//!         .and_then(|b| b.try_into().ok())
//!         .ok_or(ProtocolError::Truncated { needed: 4, available: buf.len() })?;
//!     Ok(u32::from_le_bytes(raw))
//! }
//!
//! match parse_len(&[1, 0]) {
//!     Ok(len) => info!(len, "parsed length"),
//!     Err(e) => error!(error = %e, "failed to parse length"),
//! }
//! ```

use crate::protocol::jobs::JobId;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Client is not connected";
    pub const ERR_NO_CANDIDATES: &str = "No candidate servers available";
    pub const ERR_DISCOVERY_EXHAUSTED: &str = "No server answered discovery after all retries";
    pub const ERR_CLIENT_STOPPED: &str = "Client task has stopped";
    pub const ERR_CONNECT_CANCELLED: &str = "Connect cancelled before a server was selected";
    pub const ERR_CHANNEL_NOT_READY: &str = "Channel encryption not established";
    pub const ERR_NOT_LOGGED_ON: &str = "Session is not logged on";

    /// Handshake errors
    pub const ERR_UNEXPECTED_PROTOCOL_VERSION: &str = "Encryption handshake protocol version mismatch";
    pub const ERR_UNIVERSE_MISMATCH: &str = "Server reported a different universe";
    pub const ERR_UNKNOWN_UNIVERSE: &str = "No public key known for universe";
    pub const ERR_SHORT_CHALLENGE: &str = "Encryption challenge shorter than 16 bytes";
    pub const ERR_NO_PENDING_KEY: &str = "Encrypt result received without a pending session key";
    pub const ERR_RSA_ENCRYPT: &str = "Failed to encrypt session key";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Invalid universe public key";

    /// Codec errors
    pub const ERR_BAD_TCP_MAGIC: &str = "Frame magic mismatch";
    pub const ERR_BAD_UDP_MAGIC: &str = "Datagram magic mismatch";
    pub const ERR_NON_PROTO_MULTI: &str = "Multi message without protobuf body";
    pub const ERR_INVALID_METHOD_NAME: &str = "Malformed service method name";

    /// Compression errors
    pub const ERR_UNKNOWN_COMPRESSION: &str = "Unknown compression magic";
    pub const ERR_BAD_FOOTER: &str = "Compression footer magic mismatch";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Disconnected")]
    Disconnected,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Buffer truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid protocol header: {0}")]
    InvalidHeader(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decompression failed: {0}")]
    DecompressionFailure(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Message authentication failed: HMAC from server did not match computed HMAC")]
    AuthenticationTag,

    #[error("Job {0} timed out")]
    JobTimeout(JobId),

    #[error("Job {0} failed remotely")]
    JobFailed(JobId),

    #[error("Job {0} was cancelled")]
    JobCancelled(JobId),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Errors that only invalidate the message being decoded.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::DecodeError(_)
                | ProtocolError::Truncated { .. }
                | ProtocolError::InvalidHeader(_)
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::DecompressionFailure(_)
        )
    }

    /// Errors after which the current connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::WebSocket(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::ConnectionFailed(_)
                | ProtocolError::ConnectionTimeout
                | ProtocolError::Disconnected
                | ProtocolError::HandshakeError(_)
                | ProtocolError::AuthenticationTag
                | ProtocolError::DecryptionFailure
        )
    }
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(e: prost::DecodeError) -> Self {
        ProtocolError::DecodeError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::WebSocket(e.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
