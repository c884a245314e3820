//! Binary frame format.
//!
//! Frame layout (5 bytes header + payload), optionally followed by an
//! embedded body when the envelope says so:
//!
//! ```text
//! +--------+-------------+-----------------------+
//! |  tag   | payload_len | payload               |
//! | 1 byte | 4 bytes i32 | payload_len bytes     |
//! +--------+-------------+-----------------------+
//! [ body_len: 8 bytes i64 | body_len raw bytes   ]
//! ```
//!
//! Both length fields are little-endian. Peers are symmetric implementations
//! of this crate, so there is no version negotiation.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (1 + 4).
pub const HEADER_LEN: usize = 5;

/// Size of the embedded body length prefix in bytes.
pub const STREAM_LENGTH_LEN: usize = 8;

/// Message tags carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    CancellationRequest = 2,
}

impl MessageType {
    /// Maps a raw tag to a known message type.
    ///
    /// Unknown tags yield `None`; readers skip such frames.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::CancellationRequest),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message tag.
    pub tag: u8,
    /// Declared payload length, as found on the wire.
    pub length: i32,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, length: i32) -> Self {
        Self {
            tag: message_type.tag(),
            length,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }

    /// Validates the declared length against `max` and returns it as a size.
    pub fn payload_len(&self, max: usize) -> Result<usize, ProtocolError> {
        if self.length < 0 {
            return Err(ProtocolError::NegativeLength(self.length));
        }
        let len = self.length as usize;
        if len > max {
            return Err(ProtocolError::FrameTooLarge {
                size: len as u64,
                max,
            });
        }
        Ok(len)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        encode_header(self.tag, self.length)
    }
}

/// Encodes a frame header.
pub fn encode_header(tag: u8, length: i32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = tag;
    header[1..].copy_from_slice(&length.to_le_bytes());
    header
}

/// Decodes a frame header. Any 5 bytes form a header; validation of the
/// length happens in [`FrameHeader::payload_len`].
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> FrameHeader {
    FrameHeader {
        tag: bytes[0],
        length: i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
    }
}

/// Encodes the length prefix written ahead of an embedded body.
pub fn encode_stream_length(length: u64) -> [u8; STREAM_LENGTH_LEN] {
    length.to_le_bytes()
}

/// Decodes the length prefix of an embedded body.
pub fn decode_stream_length(bytes: &[u8; STREAM_LENGTH_LEN]) -> Result<u64, ProtocolError> {
    let length = i64::from_le_bytes(*bytes);
    if length < 0 {
        return Err(ProtocolError::NegativeStreamLength(length));
    }
    Ok(length as u64)
}

/// A whole frame: tag plus codec-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw message tag (may be unknown to this implementation).
    pub tag: u8,
    /// Frame payload (an encoded envelope).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: message_type.tag(),
            payload: payload.into(),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }

    /// Encodes the frame into bytes, refusing payloads above `max`.
    pub fn encode(&self, max: usize) -> Result<BytesMut, ProtocolError> {
        let size = self.payload.len();
        if size > max || size > i32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: size as u64,
                max,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + size);
        buf.put_u8(self.tag);
        buf.put_i32_le(size as i32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` as soon as the header is
    /// invalid, before any payload byte is looked at.
    pub fn decode(buf: &mut BytesMut, max: usize) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = decode_header(&[buf[0], buf[1], buf[2], buf[3], buf[4]]);
        let len = header.payload_len(max)?;
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self {
            tag: header.tag,
            payload,
        }))
    }
}
