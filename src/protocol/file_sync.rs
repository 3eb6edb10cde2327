//! File-sync messages: who-has queries and file pushes

use bytes::{BufMut, BytesMut};

use super::{ProtocolError, wire};

/// Wire code of a file-sync message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileSyncKind {
    /// Receiver lacks the file (or holds a stale copy)
    Missing = 0,
    /// Receiver holds the file at the queried size
    Have = 1,
    /// Presence query
    WhoHas = 2,
    /// File content follows
    FileSend = 3,
}

impl FileSyncKind {
    /// Parse from wire value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownFileSyncType` for unassigned codes.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Self::Missing),
            1 => Ok(Self::Have),
            2 => Ok(Self::WhoHas),
            3 => Ok(Self::FileSend),
            other => Err(ProtocolError::UnknownFileSyncType(other)),
        }
    }
}

/// File presence and replication messages
///
/// A `FileSend` is always followed on the same stream by exactly `file_size`
/// raw bytes, read with [`FramedTransport::receive_raw`](super::FramedTransport::receive_raw)
/// before the next envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSyncMessage {
    /// Ask whether the receiver holds `file_name` at exactly `file_size` bytes
    WhoHas {
        /// Base name of the file
        file_name: String,
        /// Size in bytes
        file_size: u32,
    },
    /// Answer: file present with matching size
    Have,
    /// Answer: file absent or of a different size
    Missing,
    /// Header of a file push
    FileSend {
        /// Base name of the file
        file_name: String,
        /// Number of raw bytes that follow
        file_size: u32,
    },
}

impl FileSyncMessage {
    /// Wire code for this message
    #[must_use]
    pub fn kind(&self) -> FileSyncKind {
        match self {
            Self::WhoHas { .. } => FileSyncKind::WhoHas,
            Self::Have => FileSyncKind::Have,
            Self::Missing => FileSyncKind::Missing,
            Self::FileSend { .. } => FileSyncKind::FileSend,
        }
    }

    /// Append the wire encoding of this message
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the file name does not fit its
    /// length prefix.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let (file_size, file_name) = match self {
            Self::WhoHas {
                file_name,
                file_size,
            }
            | Self::FileSend {
                file_name,
                file_size,
            } => (*file_size, file_name.as_str()),
            Self::Have | Self::Missing => (0, ""),
        };

        buf.put_u32(self.kind() as u32);
        buf.put_u32(file_size);
        wire::put_str(buf, "file name", file_name)
    }

    /// Decode a message body (without the envelope discriminant)
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownFileSyncType` for unassigned message
    /// types and `ProtocolError::Malformed` for truncated fields.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let kind = FileSyncKind::from_code(wire::get_u32(&mut buf, "file-sync type")?)?;
        let file_size = wire::get_u32(&mut buf, "file_size")?;
        let file_name = wire::get_str(&mut buf, "file name")?;
        wire::finish(buf, "file-sync message")?;

        Ok(match kind {
            FileSyncKind::Missing => Self::Missing,
            FileSyncKind::Have => Self::Have,
            FileSyncKind::WhoHas => Self::WhoHas {
                file_name,
                file_size,
            },
            FileSyncKind::FileSend => Self::FileSend {
                file_name,
                file_size,
            },
        })
    }
}
