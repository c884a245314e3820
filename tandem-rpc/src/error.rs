//! RPC error types.

use std::time::Duration;
use tandem_protocol::{ErrorChain, ProtocolError};
use thiserror::Error;

/// Errors surfaced by a [`Connection`](crate::Connection).
///
/// Every call resolves to exactly one outcome; each variant here is one of
/// the failure outcomes a caller can observe.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer broke the framing rules, or a local envelope could not be
    /// encoded within limits.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    /// The remote handler failed; the chain reproduces its causes.
    #[error("remote fault: {0}")]
    Remote(ErrorChain),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("call canceled")]
    Canceled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call id {0} is already pending")]
    DuplicateCallId(u64),
}

impl RpcError {
    /// Returns whether retrying the call on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Io(_) => true,
            RpcError::Timeout(_) => true,
            RpcError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Returns the remote error chain, if this is a remote fault.
    pub fn remote(&self) -> Option<&ErrorChain> {
        match self {
            RpcError::Remote(chain) => Some(chain),
            _ => None,
        }
    }
}
