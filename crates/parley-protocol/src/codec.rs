//! Codec for encoding and decoding Parley frames.
//!
//! Every frame is a fixed-width textual header followed by the payload:
//!
//! ```text
//! +--------------------------------------+-------------------+
//! | 64 bytes: decimal length, space pad  | N bytes: payload  |
//! +--------------------------------------+-------------------+
//! ```
//!
//! There is no upper bound on the declared length. A peer can announce an
//! arbitrarily large payload and the decoder will keep buffering until it
//! arrives or the stream ends; this is a known memory exhaustion risk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough data to decode a header.
    #[error("Incomplete header: need {0} more bytes")]
    Incomplete(usize),

    /// Header is not a padded non-negative decimal integer.
    #[error("Invalid header: {0:?}")]
    InvalidHeader(String),

    /// Payload is not valid UTF-8.
    #[error("Invalid payload: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the fixed-width header for a payload of `len` bytes.
#[must_use]
pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
    let mut header = [b' '; HEADER_SIZE];
    let digits = len.to_string();
    // usize never needs more than 20 digits
    header[..digits.len()].copy_from_slice(digits.as_bytes());
    header
}

/// Encode a payload into a complete frame.
#[must_use]
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_into(payload, &mut buf);
    buf.freeze()
}

/// Encode a payload into an existing buffer.
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_slice(&encode_header(payload.len()));
    buf.put_slice(payload);
}

/// Parse a header into the payload length it announces.
///
/// Surrounding whitespace and NUL padding are ignored; anything else that
/// is not a plain decimal number is rejected.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if fewer than [`HEADER_SIZE`] bytes
/// are given, or [`ProtocolError::InvalidHeader`] if the header does not
/// hold a non-negative integer.
pub fn decode_header(data: &[u8]) -> Result<usize, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    let raw = &data[..HEADER_SIZE];
    let invalid =
        || ProtocolError::InvalidHeader(String::from_utf8_lossy(raw).trim_end().to_string());

    let text = std::str::from_utf8(raw).map_err(|_| invalid())?;
    let digits = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits.parse().map_err(|_| invalid())
}

/// Decode one complete frame from bytes, returning its payload.
///
/// # Errors
///
/// Returns an error if the header is invalid or the frame is incomplete.
pub fn decode(data: &[u8]) -> Result<Bytes, ProtocolError> {
    let length = decode_header(data)?;
    let total_size = HEADER_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(Bytes::copy_from_slice(&data[HEADER_SIZE..total_size]))
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(payload))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on a malformed header.
///
/// # Errors
///
/// Returns an error if the header is invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = decode_header(&buf[..HEADER_SIZE])?;

    // Capacity is not reserved up front so a bogus length cannot force a
    // single huge allocation; the buffer grows as bytes actually arrive.
    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Codec for streaming frame encoding/decoding over `tokio_util::codec`.
///
/// Pair it with `FramedRead` to get exact reads of header and payload
/// regardless of how the transport splits the byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        decode_from(src)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(item, dst);
        Ok(())
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(item.as_bytes(), dst);
        Ok(())
    }
}
