//! # tandem-rpc
//!
//! Bidirectional RPC over a single duplex byte stream.
//!
//! This crate provides:
//! - [`Connection`]: call multiplexing, cancellation, request timeouts and
//!   streamed upload/download bodies over one stream
//! - [`Dispatcher`]: the hook through which a connection serves the peer
//! - [`ServiceRegistry`] and [`Server`]: a ready-made dispatcher over a
//!   static table of operations
//!
//! Either side of a connection may call the other; there is no client or
//! server role at this level.

pub mod body;
pub mod calls;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod server;

pub use body::{BodyReader, OutboundBody};
pub use cancel::CancellationSignal;
pub use config::{ConfigError, ConnectionConfig};
pub use connection::Connection;
pub use dispatcher::{Dispatcher, Reply};
pub use error::RpcError;
pub use server::{Invocation, OperationKind, RegistryError, Server, ServiceRegistry};

pub use tandem_protocol::{Codec, ErrorChain, JsonCodec};
