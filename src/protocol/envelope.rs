use bytes::{BufMut, Bytes, BytesMut};

use super::{FileSyncMessage, ProtocolError, SignalMessage};

/// Message family discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Playback signal
    Signal = 0,
    /// File presence / replication
    FileSync = 1,
}

impl MessageKind {
    /// Parse from byte value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownDiscriminant` for unassigned values.
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Signal),
            1 => Ok(Self::FileSync),
            other => Err(ProtocolError::UnknownDiscriminant(other)),
        }
    }
}

/// Tagged union carried in every control frame
///
/// The variant is the discriminant, so the kind and the payload type can never
/// disagree.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Signal family
    Signal(SignalMessage),
    /// File-sync family
    FileSync(FileSyncMessage),
}

impl Envelope {
    /// Family of the wrapped message
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Signal(_) => MessageKind::Signal,
            Self::FileSync(_) => MessageKind::FileSync,
        }
    }

    /// Encode to a frame payload
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the wrapped message cannot be
    /// represented on the wire.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.kind() as u8);
        match self {
            Self::Signal(msg) => msg.encode_into(&mut buf)?,
            Self::FileSync(msg) => msg.encode_into(&mut buf)?,
        }
        Ok(buf.freeze())
    }

    /// Decode a frame payload
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownDiscriminant` if the first byte names no
    /// family, or the family decoder's error.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (&first, body) = buf
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty envelope"))?;

        match MessageKind::from_byte(first)? {
            MessageKind::Signal => SignalMessage::decode(body).map(Self::Signal),
            MessageKind::FileSync => FileSyncMessage::decode(body).map(Self::FileSync),
        }
    }
}

impl From<SignalMessage> for Envelope {
    fn from(msg: SignalMessage) -> Self {
        Self::Signal(msg)
    }
}

impl From<FileSyncMessage> for Envelope {
    fn from(msg: FileSyncMessage) -> Self {
        Self::FileSync(msg)
    }
}
