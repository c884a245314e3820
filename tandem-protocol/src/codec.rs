//! Codecs for envelope payloads, plus frame-level encoder and decoder.

use crate::error::ProtocolError;
use crate::frame::{decode_stream_length, Frame, MessageType, STREAM_LENGTH_LEN};
use crate::message::{CancellationRequest, Request, Response};
use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Serialization capability shared by both peers of a connection.
///
/// `Value` is the codec's dynamic representation; envelopes carry arguments
/// and results in it so they can be decoded into the caller's type late.
pub trait Codec: Clone + Send + Sync + 'static {
    type Value: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError>;

    fn to_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Self::Value, ProtocolError>;

    fn from_value<T: DeserializeOwned>(&self, value: Self::Value) -> Result<T, ProtocolError>;

    /// Splits a call's arguments into the list carried by a request.
    ///
    /// Tuples become one argument per element, `()` becomes no arguments and
    /// anything else is a single argument.
    fn to_arguments<T: Serialize + ?Sized>(
        &self,
        args: &T,
    ) -> Result<Vec<Self::Value>, ProtocolError>;

    /// Reassembles a request's argument list into the handler's type.
    fn from_arguments<T: DeserializeOwned>(
        &self,
        args: Vec<Self::Value>,
    ) -> Result<T, ProtocolError>;
}

/// JSON codec built on `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Value = Value;

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn to_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(value)?)
    }

    fn from_value<T: DeserializeOwned>(&self, value: Value) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    fn to_arguments<T: Serialize + ?Sized>(&self, args: &T) -> Result<Vec<Value>, ProtocolError> {
        Ok(match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        })
    }

    fn from_arguments<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T, ProtocolError> {
        let whole = Value::Array(args);
        let err = match serde_json::from_value::<T>(whole.clone()) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        // Mirror of `to_arguments`: a lone argument or no argument at all.
        let fallback = match whole {
            Value::Array(mut items) if items.len() == 1 => items.pop(),
            Value::Array(items) if items.is_empty() => Some(Value::Null),
            _ => None,
        };
        match fallback {
            Some(value) => serde_json::from_value(value).map_err(|_| err.into()),
            None => Err(err.into()),
        }
    }
}

/// Encodes envelopes into complete frames.
pub struct Encoder;

impl Encoder {
    pub fn encode_request<C: Codec>(
        codec: &C,
        request: &Request<C::Value>,
        max: usize,
    ) -> Result<BytesMut, ProtocolError> {
        Self::encode_envelope(codec, MessageType::Request, request, max)
    }

    pub fn encode_response<C: Codec>(
        codec: &C,
        response: &Response<C::Value>,
        max: usize,
    ) -> Result<BytesMut, ProtocolError> {
        Self::encode_envelope(codec, MessageType::Response, response, max)
    }

    pub fn encode_cancellation<C: Codec>(
        codec: &C,
        cancellation: &CancellationRequest,
        max: usize,
    ) -> Result<BytesMut, ProtocolError> {
        Self::encode_envelope(codec, MessageType::CancellationRequest, cancellation, max)
    }

    fn encode_envelope<C: Codec, T: Serialize>(
        codec: &C,
        message_type: MessageType,
        envelope: &T,
        max: usize,
    ) -> Result<BytesMut, ProtocolError> {
        let payload = codec.encode(envelope)?;
        Frame::new(message_type, payload).encode(max)
    }
}

/// Incremental decoder over a byte buffer.
///
/// Used where the whole wire is available as bytes (tests, tooling,
/// benchmarks); a live connection reads frames straight off its stream.
pub struct Decoder {
    buffer: BytesMut,
    max: usize,
}

impl Decoder {
    pub fn new(max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max)
    }

    /// Attempts to decode the length prefix of an embedded body.
    pub fn decode_stream_length(&mut self) -> Result<Option<u64>, ProtocolError> {
        if self.buffer.len() < STREAM_LENGTH_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; STREAM_LENGTH_LEN];
        prefix.copy_from_slice(&self.buffer[..STREAM_LENGTH_LEN]);
        let length = decode_stream_length(&prefix)?;
        self.buffer.advance(STREAM_LENGTH_LEN);
        Ok(Some(length))
    }

    /// Takes exactly `n` raw bytes, if that many are buffered.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.buffer.len() < n {
            return None;
        }
        Some(self.buffer.split_to(n).freeze())
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_MESSAGE_SIZE)
    }
}
