//! Control-channel wire protocol
//!
//! Every message on the TCP control channel is an [`Envelope`] carried in a
//! length-prefixed frame:
//!
//! ```text
//! [4-byte BE length][1-byte discriminant][family-specific fields]
//! ```
//!
//! Two message families share the connection: [`SignalMessage`] for
//! synchronized playback actions and [`FileSyncMessage`] for the who-has /
//! file-push exchange. A `FileSend` header is followed by exactly
//! `file_size` raw bytes outside of any frame.
//!
//! File names travel as a u16 byte count followed by that many bytes, which
//! must be UTF-8. Any valid UTF-8 name, including one with NUL bytes, comes
//! through byte for byte; other byte sequences are `Malformed`.

mod envelope;
mod file_sync;
pub mod framing;
mod signal;
mod wire;


pub use envelope::{Envelope, MessageKind};
pub use file_sync::{FileSyncKind, FileSyncMessage};
pub use framing::{BoxedStream, ControlStream, DEFAULT_MAX_FRAME_LEN, FramedTransport};
pub use signal::{SignalAction, SignalMessage};

use thiserror::Error;

/// Errors raised while framing, encoding or decoding control messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream before a complete length or payload was read
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Message bytes do not form a valid message
    #[error("malformed message: {reason}")]
    Malformed {
        /// What was wrong with the bytes
        reason: String,
    },

    /// Frame length prefix exceeds the configured maximum
    #[error("frame of {length} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Length announced by the prefix
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// Envelope discriminant matches no known message family
    #[error("unknown message discriminant: {0}")]
    UnknownDiscriminant(u8),

    /// Signal action code matches no known action
    #[error("unknown signal action: {0}")]
    UnknownSignalAction(u32),

    /// File-sync message type matches no known type
    #[error("unknown file-sync message type: {0}")]
    UnknownFileSyncType(u32),

    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Whether the error is a malformed-input condition (bad length or bytes)
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::FrameTooLarge { .. })
    }

    /// Whether the connection can keep going after this error.
    ///
    /// Unknown families and unknown actions leave the framing intact, so the
    /// offending message can be skipped.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::UnknownDiscriminant(_) | Self::UnknownSignalAction(_)
        )
    }
}

/// Wire constants
pub mod constants {
    /// Default TCP control port
    pub const CONTROL_PORT: u16 = 22222;

    /// Greeting a client sends as its first frame
    pub const GREETING: &[u8] = b"hello";

    /// Default wait between signal send and execution
    pub const DEFAULT_DELAY_SECONDS: u32 = 5;
}
