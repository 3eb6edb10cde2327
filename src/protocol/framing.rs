//! Length-prefixed framing over a byte stream
//!
//! Each frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. Boundaries come only from the prefix; partial reads from
//! the underlying stream are looped until the frame is complete.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Envelope, ProtocolError};

/// Default maximum frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length prefix size
const LENGTH_SIZE: usize = 4;

/// Byte stream usable as a control connection
pub trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlStream for T {}

/// Type-erased control stream
pub type BoxedStream = Box<dyn ControlStream>;

/// Framed transport over any async byte stream
#[derive(Debug)]
pub struct FramedTransport<S> {
    stream: S,
    max_frame_len: usize,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the default frame limit
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Wrap a stream with a custom frame limit
    pub fn with_max_frame_len(stream: S, max_frame_len: usize) -> Self {
        Self {
            stream,
            max_frame_len,
        }
    }

    /// Maximum accepted payload length
    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::FrameTooLarge` if the payload cannot be
    /// described by the length prefix, or an I/O error from the stream.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            length: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = BytesMut::with_capacity(LENGTH_SIZE + payload.len());
        frame.put_u32(length);
        frame.put_slice(payload);

        self.stream.write_all(&frame).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Receive one frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::ConnectionClosed` if the stream ends before the
    /// frame is complete and `ProtocolError::FrameTooLarge` if the prefix
    /// exceeds the configured maximum.
    pub async fn receive(&mut self) -> Result<Bytes, ProtocolError> {
        self.try_receive()
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Receive one frame, or `None` if the peer closed the stream cleanly
    /// between frames
    ///
    /// A close after part of a length prefix or payload has arrived is still
    /// `ProtocolError::ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// As [`FramedTransport::receive`], except for a close at a frame boundary.
    pub async fn try_receive(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let mut prefix = [0u8; LENGTH_SIZE];
        let mut filled = 0;
        while filled < LENGTH_SIZE {
            let n = self
                .stream
                .read(&mut prefix[filled..])
                .await
                .map_err(map_io)?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(ProtocolError::ConnectionClosed)
                };
            }
            filled += n;
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            });
        }

        self.receive_raw(length).await.map(Some)
    }

    /// Encode and send an envelope as one frame
    ///
    /// # Errors
    ///
    /// Returns encoding or stream errors.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let payload = envelope.encode()?;
        self.send(&payload).await
    }

    /// Receive one frame and decode it as an envelope
    ///
    /// # Errors
    ///
    /// Returns framing or decoding errors.
    pub async fn receive_envelope(&mut self) -> Result<Envelope, ProtocolError> {
        let payload = self.receive().await?;
        Envelope::decode(&payload)
    }

    /// Receive and decode one envelope, or `None` on a clean close between
    /// frames
    ///
    /// # Errors
    ///
    /// Returns framing or decoding errors.
    pub async fn try_receive_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        match self.try_receive().await? {
            Some(payload) => Envelope::decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Write unframed bytes, such as the content following a `FileSend`
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the stream.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(bytes).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Read exactly `len` unframed bytes
    ///
    /// `len` is bounded by the frame limit; read longer content in chunks.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::FrameTooLarge` if `len` exceeds the frame
    /// limit and `ProtocolError::ConnectionClosed` if the stream ends early.
    pub async fn receive_raw(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                length: len,
                max: self.max_frame_len,
            });
        }

        let mut payload = BytesMut::zeroed(len);
        self.stream.read_exact(&mut payload).await.map_err(map_io)?;
        Ok(payload.freeze())
    }

    /// Shut down the write half of the stream
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await.map_err(map_io)
    }

    /// Borrow the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn map_io(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(err)
    }
}
