//! A bidirectional RPC connection over one duplex byte stream.
//!
//! Both peers issue calls and serve calls on the same stream. Writes are
//! serialized one unit at a time (a frame, or a frame followed by its
//! length-prefixed body); the receive loop is the only reader, except while
//! a [`BodyReader`] it handed out holds the read half.

use crate::body::{BodyReader, BodyRelease, BoxReader, BoxWriter, OutboundBody, ReleasedReader};
use crate::calls::{CallResult, CallTable, Delivered};
use crate::cancel::CancellationSignal;
use crate::config::ConnectionConfig;
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::RpcError;
use bytes::BytesMut;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::{
    decode_header, decode_stream_length, encode_stream_length, CancellationRequest, Codec,
    Encoder, ErrorChain, JsonCodec, MessageType, Outcome, ProtocolError, Request, Response,
    HEADER_LEN, STREAM_LENGTH_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

type ClosedObserver = Box<dyn FnOnce() + Send>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<BoxWriter>>>;

/// One end of a tandem connection.
pub struct Connection<C: Codec = JsonCodec> {
    name: String,
    config: ConnectionConfig,
    codec: C,
    writer: SharedWriter,
    /// Present until `listen` takes it.
    reader: Mutex<Option<BoxReader>>,
    calls: CallTable<C::Value>,
    next_id: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    observers: Mutex<Vec<ClosedObserver>>,
    dispatcher: RwLock<Option<Arc<dyn Dispatcher<C::Value>>>>,
}

impl Connection<JsonCodec> {
    /// A JSON connection over `stream`.
    pub fn json<S>(stream: S, config: ConnectionConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(stream, config, JsonCodec)
    }
}

impl<C: Codec> Connection<C> {
    /// Wraps a duplex stream. Call [`listen`](Self::listen) to start
    /// receiving.
    pub fn new<S>(stream: S, config: ConnectionConfig, codec: C) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), config, codec)
    }

    /// Wraps separate read and write halves, e.g. a pair of pipes.
    pub fn from_parts(
        reader: BoxReader,
        writer: BoxWriter,
        config: ConnectionConfig,
        codec: C,
    ) -> Arc<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{} {}", config.name, &suffix[..8]);
        let (closed_tx, _) = watch::channel(false);

        tracing::debug!("[{}] Connection created (codec {})", name, codec.name());
        if let Err(err) = config.validate() {
            tracing::warn!("[{}] {}", name, err);
        }

        Arc::new(Self {
            name,
            config,
            codec,
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            reader: Mutex::new(Some(reader)),
            calls: CallTable::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_tx,
            observers: Mutex::new(Vec::new()),
            dispatcher: RwLock::new(None),
        })
    }

    /// Installs the handler for inbound requests and cancellations.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher<C::Value>>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ids of calls still waiting for an outcome, ascending.
    pub fn pending_calls(&self) -> Vec<u64> {
        self.calls.ids()
    }

    // ------------------------------------------------------------------
    // Outgoing calls
    // ------------------------------------------------------------------

    /// Calls `operation` and decodes its result.
    ///
    /// `args` is split into arguments by the codec: a tuple gives one
    /// argument per element, `()` gives none. With [`JsonCodec`] any
    /// top-level sequence is split the same way and `null` gives no
    /// arguments, so a single array or null argument must be wrapped in a
    /// one-element tuple: `&(vec![1, 2],)`, `&(Value::Null,)`.
    pub async fn call<A, R>(
        &self,
        operation: &str,
        args: &A,
        cancel: &CancellationSignal,
    ) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arguments = self.codec.to_arguments(args)?;
        let delivered = self.invoke(operation, arguments, None, false, cancel).await?;
        self.expect_value(delivered)
    }

    /// Calls `operation`, streaming `body` to the peer after the request.
    pub async fn call_upload<A, R>(
        &self,
        operation: &str,
        args: &A,
        body: OutboundBody,
        cancel: &CancellationSignal,
    ) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arguments = self.codec.to_arguments(args)?;
        let delivered = self
            .invoke(operation, arguments, Some(body), false, cancel)
            .await?;
        self.expect_value(delivered)
    }

    /// Calls `operation` and returns the body the peer streams back.
    ///
    /// The receive loop is parked until the returned reader is drained or
    /// dropped, so consume it promptly.
    pub async fn call_download<A>(
        &self,
        operation: &str,
        args: &A,
        cancel: &CancellationSignal,
    ) -> Result<BodyReader, RpcError>
    where
        A: Serialize + ?Sized,
    {
        let arguments = self.codec.to_arguments(args)?;
        match self.invoke(operation, arguments, None, true, cancel).await? {
            Delivered::Body(body) => Ok(body),
            Delivered::Value(_) => Err(ProtocolError::MissingBody.into()),
        }
    }

    /// Sends a one-way request. Nothing is awaited beyond the write.
    pub async fn notify<A>(&self, operation: &str, args: &A) -> Result<(), RpcError>
    where
        A: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let arguments = self.codec.to_arguments(args)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, operation, arguments);
        let frame = Encoder::encode_request(&self.codec, &request, self.config.max_message_size)?;

        tracing::debug!("[{}] Notify {} (id={})", self.name, operation, id);
        self.send_unit(frame, None, None).await.map_err(|failure| self.settle(failure))
    }

    /// Abandons a pending call: it fails with `Canceled` and the peer is
    /// told to stop. Returns false if the call already has an outcome.
    ///
    /// Abandoning an upload closes the whole connection.
    pub fn cancel(&self, id: u64) -> bool {
        self.abandon(id, RpcError::Canceled)
    }

    fn expect_value<R: DeserializeOwned>(
        &self,
        delivered: Delivered<C::Value>,
    ) -> Result<R, RpcError> {
        match delivered {
            Delivered::Value(value) => Ok(self.codec.from_value(value)?),
            Delivered::Body(body) => {
                body.close();
                let err = ProtocolError::Codec("response carried an unexpected body".into());
                Err(err.into())
            }
        }
    }

    async fn invoke(
        &self,
        operation: &str,
        arguments: Vec<C::Value>,
        body: Option<OutboundBody>,
        expects_body: bool,
        cancel: &CancellationSignal,
    ) -> CallResult<C::Value> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        if cancel.is_cancelled() {
            return Err(RpcError::Canceled);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = Request::new(id, operation, arguments);
        if body.is_some() {
            request = request.with_embedded_stream();
        }
        let frame = Encoder::encode_request(&self.codec, &request, self.config.max_message_size)?;

        let mut receiver = if body.is_some() {
            self.calls.register_upload(id)?
        } else {
            self.calls.register(id, expects_body)?
        };
        let _pending = PendingGuard {
            calls: &self.calls,
            id,
        };
        // A dispose that raced registration may already have drained.
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        tracing::debug!(
            "[{}] Request: {} (id={}, body={})",
            self.name,
            operation,
            id,
            body.is_some()
        );
        if let Err(failure) = self.send_unit(frame, body, Some(cancel)).await {
            return Err(self.settle(failure));
        }

        let timeout = self.config.request_timeout();
        let deadline = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            result = &mut receiver => return result.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = cancel.cancelled() => {
                self.abandon(id, RpcError::Canceled);
            }
            _ = &mut deadline => {
                tracing::debug!("[{}] Request id={} timed out", self.name, id);
                self.abandon(id, RpcError::Timeout(timeout.unwrap_or_default()));
            }
        }
        // Either our abandon or a response that beat it resolved the call.
        receiver.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    fn abandon(&self, id: u64, reason: RpcError) -> bool {
        match self.calls.remove(id) {
            Some(call) if call.uploads => {
                // The peer may still be parked on the body, where it would
                // never see a CancellationRequest.
                tracing::debug!(
                    "[{}] Upload id={} abandoned, closing connection",
                    self.name,
                    id
                );
                call.complete(Err(reason));
                self.dispose();
                true
            }
            Some(call) => {
                call.complete(Err(reason));
                self.send_cancellation(id);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Answers an inbound request, optionally followed by a download body.
    ///
    /// A response that cannot be encoded within the size limit is replaced
    /// by a fault, so the remote caller still gets an outcome.
    pub async fn send_response(
        &self,
        request_id: u64,
        outcome: Outcome<C::Value>,
        body: Option<OutboundBody>,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let response = Response {
            request_id,
            outcome,
            has_embedded_stream: body.is_some(),
        };
        let max = self.config.max_message_size;

        match Encoder::encode_response(&self.codec, &response, max) {
            Ok(frame) => self
                .send_unit(frame, body, None)
                .await
                .map_err(|failure| self.settle(failure)),
            Err(err) => {
                tracing::warn!(
                    "[{}] Response to {} could not be encoded: {}",
                    self.name,
                    request_id,
                    err
                );
                let fault: Response<C::Value> =
                    Response::fault(request_id, ErrorChain::from_error(&err));
                let frame = Encoder::encode_response(&self.codec, &fault, max)?;
                self.send_unit(frame, None, None)
                    .await
                    .map_err(|failure| self.settle(failure))?;
                Err(err.into())
            }
        }
    }

    async fn send_unit(
        &self,
        frame: BytesMut,
        body: Option<OutboundBody>,
        abort: Option<&CancellationSignal>,
    ) -> Result<(), SendFailure> {
        // The write runs on its own task so a caller giving up halfway can
        // never leave a partial unit on the wire.
        let write = write_unit(
            self.writer.clone(),
            self.closed_tx.subscribe(),
            frame,
            body,
            abort.cloned(),
            self.config.copy_buffer_size,
        );
        match tokio::spawn(write).await {
            Ok(result) => result,
            Err(err) => Err(SendFailure::Fatal(RpcError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("write task failed: {err}"),
            )))),
        }
    }

    /// Turns a send failure into the caller's error, tearing the connection
    /// down when the wire is no longer in sync.
    fn settle(&self, failure: SendFailure) -> RpcError {
        match failure {
            SendFailure::Call(err) => err,
            SendFailure::Fatal(err) => {
                if !self.is_closed() {
                    tracing::warn!("[{}] Write interrupted mid-unit: {}", self.name, err);
                }
                self.dispose();
                err
            }
        }
    }

    fn send_cancellation(&self, request_id: u64) {
        let cancellation = CancellationRequest { request_id };
        let frame = match Encoder::encode_cancellation(
            &self.codec,
            &cancellation,
            self.config.max_message_size,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("[{}] Cannot encode cancellation: {}", self.name, err);
                return;
            }
        };

        tracing::debug!("[{}] Cancel: id={}", self.name, request_id);
        let write = write_unit(
            self.writer.clone(),
            self.closed_tx.subscribe(),
            frame,
            None,
            None,
            self.config.copy_buffer_size,
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                "[{}] No runtime, cancellation for {} not sent",
                self.name,
                request_id
            );
            return;
        };
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(failure) = write.await {
                tracing::debug!(
                    "[{}] Cancellation for {} not sent: {}",
                    name,
                    request_id,
                    failure.error()
                );
            }
        });
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Runs the receive loop until the connection closes.
    ///
    /// Returns `Ok` when the peer ends the stream cleanly or the connection
    /// is disposed locally, and the fatal error otherwise. The connection is
    /// disposed either way. A second call waits for the first to finish.
    pub async fn listen(self: Arc<Self>) -> Result<(), RpcError> {
        let reader = self.reader.lock().take();
        let Some(reader) = reader else {
            self.closed().await;
            return Ok(());
        };

        tracing::debug!("[{}] Receive loop started", self.name);
        let result = self.receive_loop(reader).await;
        match &result {
            Ok(()) if self.is_closed() => {
                tracing::debug!("[{}] Receive loop stopped", self.name)
            }
            Ok(()) => tracing::info!("[{}] Peer closed the stream", self.name),
            Err(RpcError::Protocol(err)) if err.is_framing() => {
                tracing::error!("[{}] Lost frame sync: {}", self.name, err)
            }
            Err(err) => tracing::error!("[{}] Receive loop failed: {}", self.name, err),
        }
        self.dispose();
        result
    }

    async fn receive_loop(self: &Arc<Self>, mut reader: BoxReader) -> Result<(), RpcError> {
        let mut closed = self.closed_tx.subscribe();
        let max = self.config.max_message_size;

        loop {
            let mut header = [0u8; HEADER_LEN];
            let Some(read) = until_closed(&mut closed, read_header(&mut reader, &mut header)).await
            else {
                return Ok(());
            };
            if !read? {
                return Ok(());
            }

            let header = decode_header(&header);
            let len = header.payload_len(max)?;
            let mut payload = vec![0u8; len];
            let Some(read) = until_closed(&mut closed, reader.read_exact(&mut payload)).await
            else {
                return Ok(());
            };
            read?;

            let next = match header.message_type() {
                Some(MessageType::Response) => {
                    self.on_response(&payload, reader, &mut closed).await?
                }
                Some(MessageType::Request) => self.on_request(&payload, reader, &mut closed).await?,
                Some(MessageType::CancellationRequest) => {
                    self.on_cancellation(&payload)?;
                    Some(reader)
                }
                None => {
                    tracing::warn!(
                        "[{}] Ignoring frame with unknown tag {} ({} bytes)",
                        self.name,
                        header.tag,
                        len
                    );
                    Some(reader)
                }
            };
            match next {
                Some(back) => reader = back,
                None => return Ok(()),
            }
        }
    }

    async fn on_response(
        &self,
        payload: &[u8],
        mut reader: BoxReader,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<Option<BoxReader>, RpcError> {
        let response: Response<C::Value> = self.codec.decode(payload)?;
        let id = response.request_id;
        tracing::debug!(
            "[{}] Response: id={} ok={} body={}",
            self.name,
            id,
            response.outcome.is_success(),
            response.has_embedded_stream
        );

        let call = self.calls.remove(id);
        if call.is_none() {
            tracing::debug!("[{}] No pending call for id={}", self.name, id);
        }

        if !response.has_embedded_stream {
            if let Some(call) = call {
                let result = match response.outcome {
                    Outcome::Success(_) if call.expects_body => {
                        Err(ProtocolError::MissingBody.into())
                    }
                    Outcome::Success(value) => Ok(Delivered::Value(value)),
                    Outcome::Fault(chain) => Err(RpcError::Remote(chain)),
                };
                call.complete(result);
            }
            return Ok(Some(reader));
        }

        let Some(length) = until_closed(closed, read_stream_length(&mut reader)).await else {
            return Ok(None);
        };
        let length = length?;
        let (body, release) = BodyReader::new(reader, length);

        match (call, response.outcome) {
            (Some(call), Outcome::Success(_)) if call.expects_body => {
                // A caller that already left drops the body, releasing it.
                call.complete(Ok(Delivered::Body(body)));
            }
            (Some(call), outcome) => {
                drop(body);
                call.complete(match outcome {
                    Outcome::Success(value) => Ok(Delivered::Value(value)),
                    Outcome::Fault(chain) => Err(RpcError::Remote(chain)),
                });
            }
            (None, _) => {
                tracing::debug!("[{}] Discarding {} byte body", self.name, length);
                drop(body);
            }
        }

        self.reclaim(release, closed).await
    }

    async fn on_request(
        self: &Arc<Self>,
        payload: &[u8],
        mut reader: BoxReader,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<Option<BoxReader>, RpcError> {
        let request: Request<C::Value> = self.codec.decode(payload)?;
        tracing::debug!(
            "[{}] Incoming: {} (id={}, body={})",
            self.name,
            request.operation,
            request.id,
            request.has_embedded_stream
        );

        if !request.has_embedded_stream {
            self.dispatch(request, None);
            return Ok(Some(reader));
        }

        let Some(length) = until_closed(closed, read_stream_length(&mut reader)).await else {
            return Ok(None);
        };
        let (body, release) = BodyReader::new(reader, length?);
        self.dispatch(request, Some(body));
        self.reclaim(release, closed).await
    }

    fn on_cancellation(&self, payload: &[u8]) -> Result<(), RpcError> {
        let CancellationRequest { request_id } = self.codec.decode(payload)?;
        tracing::debug!("[{}] Peer canceled id={}", self.name, request_id);

        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatcher) = dispatcher {
            let handled =
                std::panic::catch_unwind(AssertUnwindSafe(|| dispatcher.on_cancellation(request_id)));
            if let Err(panic) = handled {
                tracing::warn!(
                    "[{}] Cancellation handler panicked for id={}: {}",
                    self.name,
                    request_id,
                    panic_message(&*panic)
                );
            }
        }
        Ok(())
    }

    /// Hands a request to the dispatcher and answers it on a separate task.
    fn dispatch(self: &Arc<Self>, request: Request<C::Value>, body: Option<BodyReader>) {
        let id = request.id;
        let dispatcher = self.dispatcher.read().clone();

        let future = match dispatcher {
            Some(dispatcher) => std::panic::catch_unwind(AssertUnwindSafe(|| {
                dispatcher.on_request(request, body)
            })),
            None => {
                tracing::warn!(
                    "[{}] No dispatcher for {} (id={})",
                    self.name,
                    request.operation,
                    id
                );
                let chain = ErrorChain::new(
                    "NoDispatcher",
                    format!("'{}' cannot be served: no dispatcher installed", request.operation),
                );
                Ok(futures::future::ready(Reply::Fault(chain)).boxed())
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            let reply = match future {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let reply = reply.unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                tracing::warn!("[{}] Handler for id={} panicked: {}", this.name, id, message);
                Reply::Fault(ErrorChain::new("Panic", message))
            });
            this.respond(id, reply).await;
        });
    }

    async fn respond(&self, request_id: u64, reply: Reply<C::Value>) {
        let (outcome, body) = match reply {
            Reply::NoReply => return,
            Reply::Success(value) => (Outcome::Success(value), None),
            Reply::Fault(chain) => (Outcome::Fault(chain), None),
            Reply::Download(body) => match self.codec.to_value(&()) {
                Ok(unit) => (Outcome::Success(unit), Some(body)),
                Err(err) => (Outcome::Fault(ErrorChain::from_error(&err)), None),
            },
        };
        if let Err(err) = self.send_response(request_id, outcome, body).await {
            tracing::debug!("[{}] Response to id={} not sent: {}", self.name, request_id, err);
        }
    }

    /// Waits for a handed-out body to come back, then skips whatever the
    /// holder left unread so the next header lines up.
    async fn reclaim(
        &self,
        release: BodyRelease,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<Option<BoxReader>, RpcError> {
        let Some(released) = until_closed(closed, release).await else {
            return Ok(None);
        };
        let ReleasedReader {
            mut reader,
            remaining,
        } = released.map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "body reader vanished without releasing")
        })?;

        if remaining > 0 {
            tracing::debug!("[{}] Skipping {} unread body bytes", self.name, remaining);
            let mut unread = (&mut reader).take(remaining);
            let mut sink = tokio::io::sink();
            let skip = tokio::io::copy(&mut unread, &mut sink);
            let Some(skipped) = until_closed(closed, skip).await else {
                return Ok(None);
            };
            let skipped = skipped?;
            if skipped < remaining {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a body ({skipped} of {remaining} bytes skipped)"),
                )
                .into());
            }
        }
        Ok(Some(reader))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Closes the connection. Only the first call has any effect.
    ///
    /// Closed observers run once, then every pending call fails with
    /// `ConnectionClosed`.
    pub fn dispose(&self) {
        if self.begin_close() {
            let writer = self.writer.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        shutdown_writer(&writer).await;
                    });
                }
                Err(_) => {
                    if let Ok(mut guard) = writer.try_lock() {
                        guard.take();
                    }
                }
            }
            self.finish_close();
        }
    }

    /// Disposes the connection and waits for the write half to shut down.
    pub async fn close(&self) {
        if self.begin_close() {
            shutdown_writer(&self.writer).await;
            self.finish_close();
        } else {
            shutdown_writer(&self.writer).await;
        }
    }

    /// Completes once the connection has been disposed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Registers an observer run once when the connection closes. If it is
    /// already closed the observer runs immediately.
    pub fn on_closed(&self, observer: impl FnOnce() + Send + 'static) {
        let mut observers = self.observers.lock();
        if self.is_closed() {
            drop(observers);
            self.run_observer(Box::new(observer));
            return;
        }
        observers.push(Box::new(observer));
    }

    fn begin_close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::info!("[{}] Closing connection", self.name);
        self.closed_tx.send_replace(true);
        self.reader.lock().take();
        true
    }

    fn finish_close(&self) {
        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatcher) = dispatcher {
            let notified =
                std::panic::catch_unwind(AssertUnwindSafe(|| dispatcher.on_connection_closed()));
            if let Err(panic) = notified {
                tracing::warn!(
                    "[{}] Dispatcher close hook panicked: {}",
                    self.name,
                    panic_message(&*panic)
                );
            }
        }

        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            self.run_observer(observer);
        }

        let failed = self.calls.drain_all(|| RpcError::ConnectionClosed);
        if failed > 0 {
            tracing::debug!("[{}] Failed {} pending calls", self.name, failed);
        }
    }

    fn run_observer(&self, observer: ClosedObserver) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(observer)) {
            tracing::warn!(
                "[{}] Closed observer panicked: {}",
                self.name,
                panic_message(&*panic)
            );
        }
    }
}

impl<C: Codec> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("pending", &self.calls.len())
            .finish_non_exhaustive()
    }
}

/// Removes a call's record when its caller stops waiting, however that
/// happens. Removing an already-resolved id is a no-op.
struct PendingGuard<'a, V> {
    calls: &'a CallTable<V>,
    id: u64,
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        self.calls.remove(self.id);
    }
}

enum SendFailure {
    /// Only this unit is affected.
    Call(RpcError),
    /// Part of a unit reached the wire; the writer has been dropped.
    Fatal(RpcError),
}

impl SendFailure {
    fn error(&self) -> &RpcError {
        match self {
            SendFailure::Call(err) | SendFailure::Fatal(err) => err,
        }
    }
}

/// Writes one unit while holding the writer lock.
async fn write_unit(
    writer: SharedWriter,
    mut closed: watch::Receiver<bool>,
    frame: BytesMut,
    body: Option<OutboundBody>,
    abort: Option<CancellationSignal>,
    buffer_size: usize,
) -> Result<(), SendFailure> {
    let abort = abort.unwrap_or_default();

    let mut guard = tokio::select! {
        biased;
        _ = closed.wait_for(|closed| *closed) => {
            return Err(SendFailure::Call(RpcError::ConnectionClosed));
        }
        _ = abort.cancelled() => return Err(SendFailure::Call(RpcError::Canceled)),
        guard = writer.lock() => guard,
    };
    let Some(stream) = guard.as_mut() else {
        return Err(SendFailure::Call(RpcError::ConnectionClosed));
    };

    let has_body = body.is_some();
    let result = tokio::select! {
        biased;
        _ = closed.wait_for(|closed| *closed) => Err(SendFailure::Fatal(RpcError::ConnectionClosed)),
        // Once body bytes flow, giving up means tearing the connection down.
        _ = abort.cancelled(), if has_body => Err(SendFailure::Fatal(RpcError::Canceled)),
        result = write_frame_and_body(stream, &frame, body, buffer_size) => result,
    };
    if matches!(result, Err(SendFailure::Fatal(_))) {
        guard.take();
    }
    result
}

async fn write_frame_and_body(
    stream: &mut BoxWriter,
    frame: &[u8],
    body: Option<OutboundBody>,
    buffer_size: usize,
) -> Result<(), SendFailure> {
    stream
        .write_all(frame)
        .await
        .map_err(|err| SendFailure::Call(err.into()))?;

    if let Some(body) = body {
        stream
            .write_all(&encode_stream_length(body.len()))
            .await
            .map_err(|err| SendFailure::Fatal(err.into()))?;
        body.copy_to(stream, buffer_size)
            .await
            .map_err(|err| SendFailure::Fatal(err.into()))?;
    }

    stream
        .flush()
        .await
        .map_err(|err| SendFailure::Call(err.into()))
}

async fn shutdown_writer(writer: &SharedWriter) {
    let taken = writer.lock().await.take();
    if let Some(mut stream) = taken {
        let _ = stream.shutdown().await;
    }
}

/// Reads a frame header. `Ok(false)` means the stream ended cleanly before
/// the first header byte.
async fn read_header(reader: &mut BoxReader, header: &mut [u8; HEADER_LEN]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} of {HEADER_LEN} header bytes"),
            ));
        }
        filled += n;
    }
    Ok(true)
}

async fn read_stream_length(reader: &mut BoxReader) -> Result<u64, RpcError> {
    let mut prefix = [0u8; STREAM_LENGTH_LEN];
    reader.read_exact(&mut prefix).await?;
    Ok(decode_stream_length(&prefix)?)
}

/// Runs `fut` unless the connection closes first.
async fn until_closed<F: Future>(closed: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = closed.wait_for(|closed| *closed) => None,
        output = fut => Some(output),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests;
