//! The interface a connection uses to serve inbound requests.

use crate::body::{BodyReader, OutboundBody};
use futures::future::BoxFuture;
use std::error::Error as StdError;
use tandem_protocol::{ErrorChain, Request};

/// How a handled request is answered.
#[derive(Debug)]
pub enum Reply<V> {
    Success(V),
    Fault(ErrorChain),
    /// Success carrying a download body after the response frame.
    Download(OutboundBody),
    /// Nothing is sent back (one-way requests).
    NoReply,
}

impl<V> Reply<V> {
    /// A fault capturing `err` and its causes.
    pub fn fault<E: StdError + 'static>(err: &E) -> Self {
        Reply::Fault(ErrorChain::from_error(err))
    }
}

/// Serves the requests and cancellations a peer sends.
///
/// `on_request` is called from the receive loop and must not block; the
/// returned future is driven on its own task. When `body` is present the
/// loop reads no further frames until the body has been drained or dropped.
pub trait Dispatcher<V>: Send + Sync + 'static {
    fn on_request(
        &self,
        request: Request<V>,
        body: Option<BodyReader>,
    ) -> BoxFuture<'static, Reply<V>>;

    /// The peer abandoned the request with this id.
    fn on_cancellation(&self, request_id: u64);

    /// The connection is gone; abandon anything still running.
    fn on_connection_closed(&self) {}
}
