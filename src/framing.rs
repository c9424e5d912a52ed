//! Conversion between unframed (UDP) and length-prefixed (TCP/TLS) DNS messages.
//!
//! Pure byte transformation: nothing here looks inside the message.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProxyError;

/// Size of the big-endian length field in front of a stream DNS message.
pub const PREFIX_LEN: usize = 2;

/// Prepend the 2-byte big-endian length of `message`.
pub fn frame(message: &[u8]) -> Result<Bytes, ProxyError> {
    let len = u16::try_from(message.len()).map_err(|_| ProxyError::Frame(message.len()))?;
    let mut out = BytesMut::with_capacity(PREFIX_LEN + message.len());
    out.put_u16(len);
    out.put_slice(message);
    Ok(out.freeze())
}

/// Drop the length field of a framed message.
///
/// Returns `None` when the buffer is too short to carry a prefix. The prefix
/// value itself is not checked against the remaining length: a truncated
/// upstream read is passed on as-is.
pub fn unframe(framed: &[u8]) -> Option<&[u8]> {
    framed.get(PREFIX_LEN..)
}
