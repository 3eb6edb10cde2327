//! Bounds-checked field readers and writers shared by the message codecs

use bytes::{Buf, BufMut, BytesMut};

use super::ProtocolError;

/// Write a u16-length-prefixed UTF-8 string
pub(crate) fn put_str(buf: &mut BytesMut, field: &str, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::malformed(format!(
            "{field} is {} bytes, limit is {}",
            value.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn need(buf: &[u8], needed: usize, field: &str) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::malformed(format!(
            "truncated {field}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8, ProtocolError> {
    need(*buf, 1, field)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut &[u8], field: &str) -> Result<u32, ProtocolError> {
    need(*buf, 4, field)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_f64(buf: &mut &[u8], field: &str) -> Result<f64, ProtocolError> {
    need(*buf, 8, field)?;
    Ok(buf.get_f64())
}

/// Read a u16-length-prefixed UTF-8 string
pub(crate) fn get_str(buf: &mut &[u8], field: &str) -> Result<String, ProtocolError> {
    need(*buf, 2, field)?;
    let len = usize::from(buf.get_u16());
    need(*buf, len, field)?;
    let bytes = (*buf)[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes)
        .map_err(|_| ProtocolError::malformed(format!("{field} is not valid UTF-8")))
}

/// Reject bytes left over after a complete message
pub(crate) fn finish(buf: &[u8], message: &str) -> Result<(), ProtocolError> {
    if buf.has_remaining() {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after {message}",
            buf.remaining()
        )));
    }
    Ok(())
}
