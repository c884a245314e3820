//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or coding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },

    #[error("negative frame length: {0}")]
    NegativeLength(i32),

    #[error("negative stream length: {0}")]
    NegativeStreamLength(i64),

    #[error("body truncated: announced {expected} bytes, source produced {actual}")]
    TruncatedBody { expected: u64, actual: u64 },

    #[error("response announced no body but the call expects one")]
    MissingBody,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error concerns the frame boundary itself.
    ///
    /// After a framing error nothing further can be read from the stream.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::NegativeLength(_)
                | ProtocolError::NegativeStreamLength(_)
        )
    }
}
