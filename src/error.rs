use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::client::AudioError;
use crate::protocol::ProtocolError;

/// Errors that can occur while serving or consuming synchronized playback
#[derive(Debug, Error)]
pub enum SyncError {
    /// Control-channel framing or message error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // ===== Clock Errors =====
    /// No clock reply arrived in time
    #[error("clock query to {server} timed out after {timeout:?}")]
    ClockQueryTimeout {
        /// Clock service address
        server: String,
        /// Time waited for a reply
        timeout: Duration,
    },

    /// Clock service address could not be resolved
    #[error("cannot resolve clock server {server}")]
    ClockResolve {
        /// Address as configured
        server: String,
    },

    // ===== Playback Errors =====
    /// Audio capability failure
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    // ===== Repository Errors =====
    /// Local media repository failure
    #[error("repository error for {name}: {source}")]
    Repository {
        /// File involved
        name: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// File name is not a single safe path component
    #[error("invalid file name: {name:?}")]
    InvalidFileName {
        /// Offending name
        name: String,
    },

    /// File cannot be described by the 4-byte size field
    #[error("file {name} is {size} bytes, larger than the protocol allows")]
    FileTooLarge {
        /// File name
        name: String,
        /// Actual size
        size: u64,
    },

    // ===== State Errors =====
    /// Service already started
    #[error("already running")]
    AlreadyRunning,

    /// Service not started
    #[error("not running")]
    NotRunning,

    /// Client has no open connection
    #[error("not connected")]
    NotConnected,

    /// Connection did not open with the expected greeting
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed {
        /// Remote address
        peer: SocketAddr,
        /// What went wrong
        reason: String,
    },

    /// Peer sent a valid message that is wrong at this point of the exchange
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// What was expected
        expected: String,
        /// What was actually received
        actual: String,
    },

    // ===== I/O Errors =====
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Invalid parameter provided
    #[error("invalid parameter: {name} - {message}")]
    InvalidParameter {
        /// The name of the parameter
        name: String,
        /// Description of the error
        message: String,
    },
}

impl SyncError {
    /// Check if this error is recoverable by retrying
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ClockQueryTimeout { .. } | Self::Network(_))
    }

    /// Check if this error indicates connection loss
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::ConnectionClosed | ProtocolError::Io(_))
                | Self::NotConnected
        )
    }
}

/// Result type alias for synchronized playback operations
pub type Result<T> = std::result::Result<T, SyncError>;
