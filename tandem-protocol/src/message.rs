//! Envelope types carried in frame payloads.
//!
//! Envelopes are generic over the codec's value type `V`, so arguments and
//! results stay in the codec's own representation until a caller asks for a
//! concrete type.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// A call issued by either peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<V = serde_json::Value> {
    /// Per-connection unique call id, assigned by the sender.
    pub id: u64,

    /// Operation name, resolved by the receiving side's dispatcher.
    pub operation: String,

    /// Encoded arguments, in call order.
    #[serde(default = "Vec::new")]
    pub arguments: Vec<V>,

    /// Whether a length-prefixed body follows this frame on the wire.
    #[serde(default)]
    pub has_embedded_stream: bool,
}

impl<V> Request<V> {
    pub fn new(id: u64, operation: impl Into<String>, arguments: Vec<V>) -> Self {
        Self {
            id,
            operation: operation.into(),
            arguments,
            has_embedded_stream: false,
        }
    }

    pub fn with_embedded_stream(mut self) -> Self {
        self.has_embedded_stream = true;
        self
    }
}

/// Result of a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<V = serde_json::Value> {
    Success(V),
    Fault(ErrorChain),
}

impl<V> Outcome<V> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_result(self) -> Result<V, ErrorChain> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Fault(chain) => Err(chain),
        }
    }
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<V = serde_json::Value> {
    /// Id of the request this answers.
    pub request_id: u64,

    pub outcome: Outcome<V>,

    /// Whether a length-prefixed body follows this frame on the wire.
    #[serde(default)]
    pub has_embedded_stream: bool,
}

impl<V> Response<V> {
    pub fn success(request_id: u64, value: V) -> Self {
        Self {
            request_id,
            outcome: Outcome::Success(value),
            has_embedded_stream: false,
        }
    }

    pub fn fault(request_id: u64, error: ErrorChain) -> Self {
        Self {
            request_id,
            outcome: Outcome::Fault(error),
            has_embedded_stream: false,
        }
    }

    pub fn with_embedded_stream(mut self) -> Self {
        self.has_embedded_stream = true;
        self
    }
}

/// Asks the peer to abandon an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub request_id: u64,
}

/// Structured description of a remote failure, including its causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorChain {
    pub message: String,

    /// Free-form diagnostic text (typically a debug rendering).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    pub type_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ErrorChain>>,
}

impl ErrorChain {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            type_name: type_name.into(),
            inner: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_inner(mut self, inner: ErrorChain) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Captures an error and its `source()` chain.
    pub fn from_error<E: StdError + 'static>(err: &E) -> Self {
        if let Some(chain) = (err as &(dyn StdError + 'static)).downcast_ref::<ErrorChain>() {
            return chain.clone();
        }
        Self {
            message: err.to_string(),
            trace: Some(format!("{err:?}")),
            type_name: short_type_name(std::any::type_name::<E>()).to_string(),
            inner: err.source().map(|source| Box::new(Self::from_dyn(source))),
        }
    }

    /// Captures a type-erased error. The concrete type is unknown here, so
    /// links get a generic type name unless they already are chains.
    pub fn from_dyn(err: &(dyn StdError + 'static)) -> Self {
        if let Some(chain) = err.downcast_ref::<ErrorChain>() {
            return chain.clone();
        }
        Self {
            message: err.to_string(),
            trace: None,
            type_name: "error".to_string(),
            inner: err.source().map(|source| Box::new(Self::from_dyn(source))),
        }
    }

    /// Iterates this link and every inner link, outermost first.
    pub fn links(&self) -> impl Iterator<Item = &ErrorChain> {
        std::iter::successors(Some(self), |link| link.inner.as_deref())
    }

    /// The innermost link.
    pub fn root_cause(&self) -> &ErrorChain {
        self.links().last().unwrap_or(self)
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl StdError for ErrorChain {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.as_deref().map(|inner| inner as &(dyn StdError + 'static))
    }
}

// "std::io::error::Error" -> "Error" reads poorly; keep the last two segments.
fn short_type_name(full: &str) -> &str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rmatch_indices("::").nth(1) {
        Some((idx, _)) => &full[idx + 2..],
        None => full,
    }
}
