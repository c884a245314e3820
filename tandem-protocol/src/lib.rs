//! # tandem-protocol
//!
//! Wire protocol for tandem, a bidirectional RPC transport over one duplex
//! byte stream.
//!
//! This crate provides:
//! - The fixed 5-byte frame header (message tag + payload length)
//! - The 8-byte length prefix announcing an embedded body
//! - Request/Response/CancellationRequest envelope types
//! - The `Codec` capability and its JSON implementation
//!
//! Nothing here performs I/O; the stateful parts live in `tandem-rpc`.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Codec, Decoder, Encoder, JsonCodec};
pub use error::ProtocolError;
pub use frame::{
    decode_header, decode_stream_length, encode_header, encode_stream_length, Frame, FrameHeader,
    MessageType, HEADER_LEN, STREAM_LENGTH_LEN,
};
pub use message::{CancellationRequest, ErrorChain, Outcome, Request, Response};

/// Default maximum frame payload size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
