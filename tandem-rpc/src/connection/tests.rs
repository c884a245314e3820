use super::*;
use crate::server::{Server, ServiceRegistry};
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use serde_json::{json, Value};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tandem_protocol::{encode_header, Decoder, Frame};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const MAX: usize = 1 << 20;
const WAIT: Duration = Duration::from_secs(5);

/// The far end of a connection, speaking raw frames.
struct RawPeer {
    stream: DuplexStream,
    decoder: Decoder,
}

impl RawPeer {
    async fn fill(&mut self) {
        let mut buf = [0u8; 8192];
        let n = timeout(WAIT, self.stream.read(&mut buf))
            .await
            .expect("peer read timed out")
            .unwrap();
        assert!(n > 0, "connection ended the stream");
        self.decoder.extend(&buf[..n]);
    }

    async fn frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.decoder.decode_frame().unwrap() {
                return frame;
            }
            self.fill().await;
        }
    }

    async fn request(&mut self) -> Request {
        let frame = self.frame().await;
        assert_eq!(frame.message_type(), Some(MessageType::Request));
        JsonCodec.decode(&frame.payload).unwrap()
    }

    async fn response(&mut self) -> Response {
        let frame = self.frame().await;
        assert_eq!(frame.message_type(), Some(MessageType::Response));
        JsonCodec.decode(&frame.payload).unwrap()
    }

    async fn cancellation(&mut self) -> CancellationRequest {
        let frame = self.frame().await;
        assert_eq!(frame.message_type(), Some(MessageType::CancellationRequest));
        JsonCodec.decode(&frame.payload).unwrap()
    }

    async fn body(&mut self) -> Bytes {
        let length = loop {
            if let Some(length) = self.decoder.decode_stream_length().unwrap() {
                break length as usize;
            }
            self.fill().await;
        };
        loop {
            if let Some(body) = self.decoder.take(length) {
                return body;
            }
            self.fill().await;
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn respond(&mut self, response: Response) {
        let frame = Encoder::encode_response(&JsonCodec, &response, MAX).unwrap();
        self.send(&frame).await;
    }

    async fn respond_with_body(&mut self, response: Response, body: &[u8]) {
        self.respond(response.with_embedded_stream()).await;
        self.send(&encode_stream_length(body.len() as u64)).await;
        self.send(body).await;
    }

    async fn call(&mut self, request: Request) {
        let frame = Encoder::encode_request(&JsonCodec, &request, MAX).unwrap();
        self.send(&frame).await;
    }

    /// True once the connection has shut its write half.
    async fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(timeout(WAIT, self.stream.read(&mut buf)).await, Ok(Ok(0)))
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new("test").with_max_message_size(MAX)
}

fn setup(config: ConnectionConfig) -> (Arc<Connection>, RawPeer, JoinHandle<Result<(), RpcError>>) {
    let (local, remote) = tokio::io::duplex(1 << 20);
    let conn = Connection::json(local, config);
    let listener = tokio::spawn(conn.clone().listen());
    let peer = RawPeer {
        stream: remote,
        decoder: Decoder::new(MAX),
    };
    (conn, peer, listener)
}

fn spawn_call(conn: &Arc<Connection>, operation: &'static str, arg: Value) -> JoinHandle<Result<Value, RpcError>> {
    let conn = conn.clone();
    tokio::spawn(async move { conn.call(operation, &arg, &CancellationSignal::new()).await })
}

fn spawn_download(conn: &Arc<Connection>, operation: &'static str) -> JoinHandle<Result<BodyReader, RpcError>> {
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.call_download(operation, &(), &CancellationSignal::new())
            .await
    })
}

async fn join<T>(handle: JoinHandle<T>) -> T {
    timeout(WAIT, handle).await.expect("task timed out").unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Answers a handful of operations directly, without a registry.
struct Scripted {
    cancellations: Arc<AtomicUsize>,
}

impl Dispatcher<Value> for Scripted {
    fn on_request(&self, request: Request, _body: Option<BodyReader>) -> BoxFuture<'static, Reply<Value>> {
        match request.operation.as_str() {
            "echo" => {
                let value = request.arguments.into_iter().next().unwrap_or(Value::Null);
                future::ready(Reply::Success(value)).boxed()
            }
            "big" => future::ready(Reply::Success(json!("x".repeat(4096)))).boxed(),
            "panic_now" => panic!("dispatcher exploded"),
            "panic_later" => future::lazy(|_| -> Reply<Value> { panic!("handler exploded") }).boxed(),
            _ => future::ready(Reply::NoReply).boxed(),
        }
    }

    fn on_cancellation(&self, _request_id: u64) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        panic!("cancellation hook exploded");
    }
}

fn registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new(JsonCodec);
    registry
        .unary("echo", |(value,): (Value,), _cancel| async move {
            Ok::<_, ErrorChain>(value)
        })
        .unwrap()
        .unary("sum", |values: Vec<i64>, _cancel| async move {
            Ok::<_, ErrorChain>(values.iter().sum::<i64>())
        })
        .unwrap()
        .unary("wait", |(): (), cancel: CancellationSignal| async move {
            cancel.cancelled().await;
            Err::<(), _>(ErrorChain::new("Canceled", "stopped waiting"))
        })
        .unwrap()
        .download("bytes", |n: usize, _cancel| async move {
            Ok::<_, ErrorChain>(OutboundBody::from_bytes(pattern(n)))
        })
        .unwrap()
        .upload("count", |(): (), body: BodyReader, _cancel| async move {
            let data = body.read_to_bytes().await?;
            Ok::<_, io::Error>(data.len())
        })
        .unwrap();
    registry
}

// ----------------------------------------------------------------------
// Outgoing calls
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_echo_call() {
    let (conn, mut peer, _listener) = setup(config());
    let call = spawn_call(&conn, "echo", json!(5));

    let request = peer.request().await;
    assert_eq!(request.operation, "echo");
    assert_eq!(request.arguments, vec![json!(5)]);
    assert!(!request.has_embedded_stream);
    peer.respond(Response::success(request.id, json!(5))).await;

    assert_eq!(join(call).await.unwrap(), json!(5));
    assert!(conn.pending_calls().is_empty());
}

#[tokio::test]
async fn test_responses_out_of_order() {
    let (conn, mut peer, _listener) = setup(config());
    let first = spawn_call(&conn, "echo", json!("one"));
    let r1 = peer.request().await;
    let second = spawn_call(&conn, "echo", json!("two"));
    let r2 = peer.request().await;
    assert_eq!((r1.id, r2.id), (1, 2));
    assert_eq!(conn.pending_calls(), vec![1, 2]);

    peer.respond(Response::success(r2.id, json!("two"))).await;
    assert_eq!(join(second).await.unwrap(), json!("two"));
    peer.respond(Response::success(r1.id, json!("one"))).await;
    assert_eq!(join(first).await.unwrap(), json!("one"));
}

#[tokio::test]
async fn test_ids_unique_and_increasing() {
    let (conn, mut peer, _listener) = setup(config());

    let mut previous = 0;
    for n in 0..3 {
        let call = spawn_call(&conn, "echo", json!(n));
        let request = peer.request().await;
        assert!(request.id > previous);
        previous = request.id;
        peer.respond(Response::success(request.id, json!(n))).await;
        join(call).await.unwrap();
    }

    let calls: Vec<_> = (0..20).map(|n| spawn_call(&conn, "echo", json!(n))).collect();
    let mut ids = Vec::new();
    for _ in 0..20 {
        let request = peer.request().await;
        peer.respond(Response::success(request.id, request.arguments[0].clone()))
            .await;
        ids.push(request.id);
    }
    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(join(call).await.unwrap(), json!(n));
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert!(ids[0] > previous);
}

#[tokio::test]
async fn test_cancel_signal_sends_cancellation() {
    let (conn, mut peer, _listener) = setup(config());
    let signal = CancellationSignal::new();
    let call = {
        let conn = conn.clone();
        let signal = signal.clone();
        tokio::spawn(async move { conn.call::<_, Value>("wait", &(), &signal).await })
    };

    let request = peer.request().await;
    assert!(signal.cancel());
    assert!(matches!(join(call).await, Err(RpcError::Canceled)));

    let cancellation = peer.cancellation().await;
    assert_eq!(cancellation.request_id, request.id);
    assert!(conn.pending_calls().is_empty());

    // A late response for the canceled call is ignored.
    peer.respond(Response::success(request.id, json!(1))).await;
    let next = spawn_call(&conn, "echo", json!(2));
    let request = peer.request().await;
    peer.respond(Response::success(request.id, json!(2))).await;
    assert_eq!(join(next).await.unwrap(), json!(2));
}

#[tokio::test]
async fn test_already_cancelled_signal_sends_nothing() {
    let (conn, _peer, _listener) = setup(config());
    let signal = CancellationSignal::new();
    signal.cancel();
    let result = conn.call::<_, Value>("echo", &1, &signal).await;
    assert!(matches!(result, Err(RpcError::Canceled)));
    assert!(conn.pending_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_by_id() {
    let (conn, mut peer, _listener) = setup(config());
    let call = spawn_call(&conn, "wait", Value::Null);
    let request = peer.request().await;

    assert!(conn.cancel(request.id));
    assert!(!conn.cancel(request.id));
    assert!(matches!(join(call).await, Err(RpcError::Canceled)));
    assert_eq!(peer.cancellation().await.request_id, request.id);
}

#[tokio::test]
async fn test_request_timeout() {
    let config = config().with_request_timeout(Duration::from_millis(50));
    let (conn, mut peer, _listener) = setup(config);
    let call = spawn_call(&conn, "wait", Value::Null);

    let request = peer.request().await;
    match join(call).await {
        Err(RpcError::Timeout(after)) => assert_eq!(after, Duration::from_millis(50)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peer.cancellation().await.request_id, request.id);
    assert!(conn.pending_calls().is_empty());
}

#[tokio::test]
async fn test_remote_fault() {
    let (conn, mut peer, _listener) = setup(config());
    let call = spawn_call(&conn, "divide", json!([1, 0]));

    let request = peer.request().await;
    assert_eq!(request.arguments, vec![json!(1), json!(0)]);
    let chain = ErrorChain::new("MathError", "cannot divide")
        .with_inner(ErrorChain::new("DivideByZero", "denominator is zero"));
    peer.respond(Response::fault(request.id, chain)).await;

    let err = join(call).await.unwrap_err();
    let remote = err.remote().expect("remote fault");
    assert_eq!(remote.type_name, "MathError");
    assert_eq!(remote.root_cause().message, "denominator is zero");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_notify_registers_nothing() {
    let (conn, mut peer, _listener) = setup(config());
    conn.notify("log", &"hello").await.unwrap();

    let request = peer.request().await;
    assert_eq!(request.operation, "log");
    assert_eq!(request.arguments, vec![json!("hello")]);
    assert!(conn.pending_calls().is_empty());
}

#[tokio::test]
async fn test_oversize_request_fails_only_the_call() {
    let (conn, mut peer, _listener) = setup(ConnectionConfig::new("small").with_max_message_size(128));
    let result = conn
        .call::<_, Value>("echo", &"x".repeat(200), &CancellationSignal::new())
        .await;
    assert!(matches!(
        result,
        Err(RpcError::Protocol(ProtocolError::FrameTooLarge { .. }))
    ));
    assert!(!conn.is_closed());
    assert!(conn.pending_calls().is_empty());

    let call = spawn_call(&conn, "echo", json!(1));
    let request = peer.request().await;
    peer.respond(Response::success(request.id, json!(1))).await;
    assert_eq!(join(call).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_no_interleaving_under_concurrency() {
    let (conn, mut peer, _listener) = setup(config());
    let calls: Vec<_> = (0..16u8)
        .map(|marker| {
            let conn = conn.clone();
            tokio::spawn(async move {
                let body = OutboundBody::from_bytes(vec![marker; 5000]);
                conn.call_upload::<_, Value>("store", &marker, body, &CancellationSignal::new())
                    .await
            })
        })
        .collect();
    let plain: Vec<_> = (0..16).map(|n| spawn_call(&conn, "echo", json!(n))).collect();

    for _ in 0..32 {
        let request = peer.request().await;
        if request.has_embedded_stream {
            let marker = request.arguments[0].as_u64().unwrap() as u8;
            let body = peer.body().await;
            assert_eq!(body.len(), 5000);
            assert!(body.iter().all(|b| *b == marker), "body bytes interleaved");
        }
        peer.respond(Response::success(request.id, json!(true))).await;
    }
    for call in calls {
        assert_eq!(join(call).await.unwrap(), json!(true));
    }
    for call in plain {
        assert_eq!(join(call).await.unwrap(), json!(true));
    }
}

// ----------------------------------------------------------------------
// Bodies
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_upload_body() {
    let (conn, mut peer, _listener) = setup(config());
    let data = pattern(20_000);
    let call = {
        let conn = conn.clone();
        let body = OutboundBody::from_bytes(data.clone());
        tokio::spawn(async move {
            conn.call_upload::<_, u64>("count", &(), body, &CancellationSignal::new())
                .await
        })
    };

    let request = peer.request().await;
    assert!(request.has_embedded_stream);
    let body = peer.body().await;
    assert_eq!(body.as_ref(), &data[..]);
    peer.respond(Response::success(request.id, json!(body.len()))).await;

    assert_eq!(join(call).await.unwrap(), 20_000);
}

#[tokio::test]
async fn test_download_is_exclusive_until_drained() {
    let (conn, mut peer, _listener) = setup(config());
    let download = spawn_download(&conn, "bytes");
    let r1 = peer.request().await;
    let after = spawn_call(&conn, "echo", json!("later"));
    let r2 = peer.request().await;

    // The body and the next frame arrive back to back.
    let data = pattern(10_000);
    peer.respond_with_body(Response::success(r1.id, Value::Null), &data)
        .await;
    peer.respond(Response::success(r2.id, json!("later"))).await;

    let mut body = join(download).await.unwrap();
    assert_eq!(body.len(), 10_000);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!after.is_finished(), "a frame was read while the body was open");
    assert_eq!(conn.pending_calls(), vec![r2.id]);

    let mut received = Vec::new();
    body.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, data);
    let mut extra = [0u8; 16];
    assert_eq!(body.read(&mut extra).await.unwrap(), 0);

    assert_eq!(join(after).await.unwrap(), json!("later"));
}

#[tokio::test]
async fn test_dropped_body_is_skipped() {
    let (conn, mut peer, _listener) = setup(config());
    let download = spawn_download(&conn, "bytes");
    let r1 = peer.request().await;
    let after = spawn_call(&conn, "echo", json!("next"));
    let r2 = peer.request().await;

    peer.respond_with_body(Response::success(r1.id, Value::Null), &pattern(50_000))
        .await;
    peer.respond(Response::success(r2.id, json!("next"))).await;

    let mut body = join(download).await.unwrap();
    let mut head = [0u8; 10];
    body.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..], &pattern(10)[..]);
    drop(body);

    assert_eq!(join(after).await.unwrap(), json!("next"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_unwanted_bodies_are_discarded() {
    let (conn, mut peer, _listener) = setup(config());
    let call = spawn_call(&conn, "count", Value::Null);
    let request = peer.request().await;

    // A body for an id nobody waits for.
    peer.respond_with_body(Response::success(999, Value::Null), &[1u8; 100])
        .await;
    // A value call answered with a body keeps the value and loses the body.
    peer.respond_with_body(Response::success(request.id, json!(3)), &[2u8; 300])
        .await;
    assert_eq!(join(call).await.unwrap(), json!(3));

    let next = spawn_call(&conn, "echo", json!("synced"));
    let request = peer.request().await;
    peer.respond(Response::success(request.id, json!("synced"))).await;
    assert_eq!(join(next).await.unwrap(), json!("synced"));
}

#[tokio::test]
async fn test_download_without_body() {
    let (conn, mut peer, _listener) = setup(config());
    let download = spawn_download(&conn, "bytes");
    let request = peer.request().await;
    peer.respond(Response::success(request.id, Value::Null)).await;

    assert!(matches!(
        join(download).await,
        Err(RpcError::Protocol(ProtocolError::MissingBody))
    ));
}

#[tokio::test]
async fn test_upload_cancel_mid_body_disposes() {
    let (conn, mut peer, listener) = setup(config());
    let (mut feed, source) = tokio::io::duplex(64);
    feed.write_all(&[7u8; 32]).await.unwrap();

    let signal = CancellationSignal::new();
    let call = {
        let conn = conn.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            let body = OutboundBody::new(source, 1_000_000);
            conn.call_upload::<_, Value>("store", &(), body, &signal).await
        })
    };

    let request = peer.request().await;
    assert!(request.has_embedded_stream);
    signal.cancel();

    assert!(matches!(join(call).await, Err(RpcError::Canceled)));
    timeout(WAIT, conn.closed()).await.unwrap();
    assert!(conn.is_closed());
    join(listener).await.unwrap();
    drop(feed);
}

#[tokio::test]
async fn test_upload_cancel_after_body_disposes() {
    let (conn, mut peer, listener) = setup(config());
    let signal = CancellationSignal::new();
    let call = {
        let conn = conn.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            let body = OutboundBody::from_bytes(pattern(100));
            conn.call_upload::<_, Value>("count", &(), body, &signal).await
        })
    };

    let request = peer.request().await;
    assert_eq!(peer.body().await.len(), 100);
    signal.cancel();

    assert!(matches!(join(call).await, Err(RpcError::Canceled)));
    timeout(WAIT, conn.closed()).await.unwrap();
    // The write half is shut without a CancellationRequest.
    assert!(peer.at_eof().await);
    assert!(!conn.cancel(request.id));
    join(listener).await.unwrap();
}

#[tokio::test]
async fn test_upload_cancel_by_id_disposes() {
    let (conn, mut peer, _listener) = setup(config());
    let call = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let body = OutboundBody::from_bytes(pattern(10));
            conn.call_upload::<_, Value>("count", &(), body, &CancellationSignal::new())
                .await
        })
    };

    let request = peer.request().await;
    peer.body().await;
    assert!(conn.cancel(request.id));

    assert!(matches!(join(call).await, Err(RpcError::Canceled)));
    assert!(conn.is_closed());
    assert!(peer.at_eof().await);
}

#[tokio::test]
async fn test_zero_copy_buffer_still_uploads() {
    let mut config = config();
    config.copy_buffer_size = 0;
    let (conn, mut peer, _listener) = setup(config);
    let call = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let body = OutboundBody::from_bytes(pattern(10));
            conn.call_upload::<_, u64>("count", &(), body, &CancellationSignal::new())
                .await
        })
    };

    let request = peer.request().await;
    assert_eq!(peer.body().await.as_ref(), &pattern(10)[..]);
    peer.respond(Response::success(request.id, json!(10))).await;

    assert_eq!(join(call).await.unwrap(), 10);
    assert!(!conn.is_closed());
}

// ----------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_dispose_fails_pending_calls_once() {
    let (conn, mut peer, listener) = setup(config());
    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        conn.on_closed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let calls: Vec<_> = (0..3).map(|n| spawn_call(&conn, "echo", json!(n))).collect();
    for _ in 0..3 {
        peer.request().await;
    }
    assert_eq!(conn.pending_calls().len(), 3);

    conn.dispose();
    conn.dispose();

    for call in calls {
        assert!(matches!(join(call).await, Err(RpcError::ConnectionClosed)));
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(conn.is_closed());
    assert!(conn.pending_calls().is_empty());
    assert!(join(listener).await.is_ok());

    let late = conn.call::<_, Value>("echo", &1, &CancellationSignal::new()).await;
    assert!(matches!(late, Err(RpcError::ConnectionClosed)));
    assert!(matches!(
        conn.notify("log", &1).await,
        Err(RpcError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_concurrent_dispose_runs_observer_once() {
    let (conn, _peer, _listener) = setup(config());
    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        conn.on_closed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let disposers: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.dispose() })
        })
        .collect();
    for disposer in disposers {
        join(disposer).await;
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversize_header_disposes() {
    let config = ConnectionConfig::new("test").with_max_message_size(1_000_000);
    let (conn, mut peer, listener) = setup(config);
    let calls: Vec<_> = (0..2).map(|n| spawn_call(&conn, "echo", json!(n))).collect();
    peer.request().await;
    peer.request().await;

    peer.send(&encode_header(MessageType::Response.tag(), 50_000_000))
        .await;

    match join(listener).await {
        Err(RpcError::Protocol(ProtocolError::FrameTooLarge { size, max })) => {
            assert_eq!(size, 50_000_000);
            assert_eq!(max, 1_000_000);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(conn.is_closed());
    for call in calls {
        assert!(matches!(join(call).await, Err(RpcError::ConnectionClosed)));
    }
}

#[tokio::test]
async fn test_negative_length_disposes() {
    let (conn, mut peer, listener) = setup(config());
    peer.send(&encode_header(MessageType::Request.tag(), -1)).await;
    assert!(matches!(
        join(listener).await,
        Err(RpcError::Protocol(ProtocolError::NegativeLength(-1)))
    ));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_clean_eof_closes() {
    let (conn, peer, listener) = setup(config());
    let call = spawn_call(&conn, "echo", json!(1));
    tokio::task::yield_now().await;
    drop(peer);

    assert!(join(listener).await.is_ok());
    assert!(conn.is_closed());
    assert!(matches!(
        join(call).await,
        Err(RpcError::ConnectionClosed | RpcError::Io(_))
    ));
}

#[tokio::test]
async fn test_eof_inside_header_is_an_error() {
    let (conn, mut peer, listener) = setup(config());
    peer.send(&[1u8, 0]).await;
    drop(peer);

    assert!(matches!(join(listener).await, Err(RpcError::Io(_))));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_close_shuts_write_half() {
    let (conn, mut peer, listener) = setup(config());
    timeout(WAIT, conn.close()).await.unwrap();
    assert!(conn.is_closed());
    assert!(peer.at_eof().await);
    assert!(join(listener).await.is_ok());

    // Observers registered afterwards run straight away.
    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        conn.on_closed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    timeout(WAIT, conn.closed()).await.unwrap();
}

#[tokio::test]
async fn test_panicking_observer_is_contained() {
    let (conn, _peer, _listener) = setup(config());
    let observed = Arc::new(AtomicUsize::new(0));
    conn.on_closed(|| panic!("observer exploded"));
    {
        let observed = observed.clone();
        conn.on_closed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
    }
    conn.dispose();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------
// Inbound traffic
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_tag_is_skipped() {
    let (conn, mut peer, _listener) = setup(config());
    let call = spawn_call(&conn, "echo", json!("after"));
    let request = peer.request().await;

    peer.send(&encode_header(9, 4)).await;
    peer.send(b"junk").await;
    peer.respond(Response::success(request.id, json!("after"))).await;

    assert_eq!(join(call).await.unwrap(), json!("after"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_inbound_request_without_dispatcher() {
    let (_conn, mut peer, _listener) = setup(config());
    peer.call(Request::new(4, "echo", vec![json!(1)])).await;

    let response = peer.response().await;
    assert_eq!(response.request_id, 4);
    match response.outcome {
        Outcome::Fault(chain) => assert_eq!(chain.type_name, "NoDispatcher"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_inbound_requests_via_dispatcher() {
    let (conn, mut peer, _listener) = setup(config());
    let cancellations = Arc::new(AtomicUsize::new(0));
    conn.set_dispatcher(Arc::new(Scripted {
        cancellations: cancellations.clone(),
    }));

    peer.call(Request::new(1, "echo", vec![json!("hi")])).await;
    let response = peer.response().await;
    assert_eq!(response.request_id, 1);
    assert_eq!(response.outcome.into_result().unwrap(), json!("hi"));

    // Panics on either side of the future become faults.
    for (id, operation) in [(2, "panic_now"), (3, "panic_later")] {
        peer.call(Request::new(id, operation, vec![])).await;
        let response = peer.response().await;
        assert_eq!(response.request_id, id);
        let chain = response.outcome.into_result().unwrap_err();
        assert_eq!(chain.type_name, "Panic");
        assert!(chain.message.contains("exploded"));
    }

    // A panicking cancellation hook does not stop the loop.
    let cancel = CancellationRequest { request_id: 77 };
    let frame = Encoder::encode_cancellation(&JsonCodec, &cancel, MAX).unwrap();
    peer.send(&frame).await;
    peer.call(Request::new(5, "echo", vec![json!(5)])).await;
    assert_eq!(peer.response().await.request_id, 5);
    assert_eq!(cancellations.load(Ordering::SeqCst), 1);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_oversize_response_becomes_fault() {
    let (conn, mut peer, _listener) = setup(ConnectionConfig::new("small").with_max_message_size(512));
    conn.set_dispatcher(Arc::new(Scripted {
        cancellations: Arc::new(AtomicUsize::new(0)),
    }));

    peer.call(Request::new(8, "big", vec![])).await;
    let response = peer.response().await;
    assert_eq!(response.request_id, 8);
    let chain = response.outcome.into_result().unwrap_err();
    assert!(chain.type_name.contains("ProtocolError"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_inbound_upload_and_skip() {
    let (conn, mut peer, _listener) = setup(config());
    conn.set_dispatcher(Arc::new(Server::new(Arc::new(registry()))));

    let data = pattern(30_000);
    peer.call(Request::new(1, "count", vec![]).with_embedded_stream())
        .await;
    peer.send(&encode_stream_length(data.len() as u64)).await;
    peer.send(&data).await;
    let response = peer.response().await;
    assert_eq!(response.outcome.into_result().unwrap(), json!(30_000));

    // A body sent to an operation that takes none is skipped unread.
    peer.call(Request::new(2, "echo", vec![json!(1)]).with_embedded_stream())
        .await;
    peer.send(&encode_stream_length(1000)).await;
    peer.send(&[0u8; 1000]).await;
    peer.call(Request::new(3, "echo", vec![json!(3)])).await;

    let mut outcomes = std::collections::HashMap::new();
    for _ in 0..2 {
        let response = peer.response().await;
        outcomes.insert(response.request_id, response.outcome);
    }
    assert!(!outcomes[&2].is_success());
    assert_eq!(outcomes.remove(&3).unwrap().into_result().unwrap(), json!(3));
}

#[tokio::test]
async fn test_inbound_download() {
    let (conn, mut peer, _listener) = setup(config());
    conn.set_dispatcher(Arc::new(Server::new(Arc::new(registry()))));

    peer.call(Request::new(1, "bytes", vec![json!(10_000)])).await;
    let response = peer.response().await;
    assert!(response.outcome.is_success());
    assert!(response.has_embedded_stream);
    assert_eq!(peer.body().await.as_ref(), &pattern(10_000)[..]);
}

#[tokio::test]
async fn test_inbound_cancellation_reaches_handler() {
    let (conn, mut peer, _listener) = setup(config());
    let server = Arc::new(Server::new(Arc::new(registry())));
    conn.set_dispatcher(server.clone());

    peer.call(Request::new(5, "wait", vec![])).await;
    timeout(WAIT, async {
        while server.in_flight() != vec![5] {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let cancel = CancellationRequest { request_id: 5 };
    peer.send(&Encoder::encode_cancellation(&JsonCodec, &cancel, MAX).unwrap())
        .await;

    let response = peer.response().await;
    assert_eq!(response.request_id, 5);
    assert_eq!(response.outcome.into_result().unwrap_err().type_name, "Canceled");
    assert!(server.in_flight().is_empty());
}

// ----------------------------------------------------------------------
// Two connections
// ----------------------------------------------------------------------

struct Pair {
    left: Arc<Connection>,
    right: Arc<Connection>,
    right_server: Arc<Server>,
}

fn pair() -> Pair {
    let (a, b) = tokio::io::duplex(1 << 16);
    let left = Connection::json(a, ConnectionConfig::new("left"));
    let right = Connection::json(b, ConnectionConfig::new("right"));

    let registry = Arc::new(registry());
    let right_server = Arc::new(Server::new(registry.clone()));
    left.set_dispatcher(Arc::new(Server::new(registry)));
    right.set_dispatcher(right_server.clone());

    tokio::spawn(left.clone().listen());
    tokio::spawn(right.clone().listen());
    Pair {
        left,
        right,
        right_server,
    }
}

#[tokio::test]
async fn test_peers_call_each_other() {
    let Pair { left, right, .. } = pair();
    let none = CancellationSignal::new();

    let (from_left, from_right) = tokio::join!(
        left.call::<_, i64>("sum", &[1, 2, 3], &none),
        right.call::<_, String>("echo", &("back",), &none),
    );
    assert_eq!(from_left.unwrap(), 6);
    assert_eq!(from_right.unwrap(), "back");

    let body = left.call_download("bytes", &100_000, &none).await.unwrap();
    let data = body.read_to_bytes().await.unwrap();
    assert_eq!(data.as_ref(), &pattern(100_000)[..]);

    let upload = OutboundBody::from_bytes(pattern(70_000));
    let count: usize = right.call_upload("count", &(), upload, &none).await.unwrap();
    assert_eq!(count, 70_000);

    let err = left.call::<_, Value>("missing", &(), &none).await.unwrap_err();
    assert_eq!(err.remote().unwrap().type_name, "UnknownOperation");
}

#[tokio::test]
async fn test_sequence_and_null_arguments_need_wrapping() {
    let Pair { left, .. } = pair();
    let none = CancellationSignal::new();

    // Bare, they are split into two arguments and none at all.
    let err = left.call::<_, Value>("echo", &vec![1, 2], &none).await.unwrap_err();
    assert!(err.remote().is_some());
    let err = left.call::<_, Value>("echo", &Value::Null, &none).await.unwrap_err();
    assert!(err.remote().is_some());

    let echoed: Vec<i32> = left.call("echo", &(vec![1, 2],), &none).await.unwrap();
    assert_eq!(echoed, vec![1, 2]);
    let echoed: Value = left.call("echo", &(Value::Null,), &none).await.unwrap();
    assert_eq!(echoed, Value::Null);
}

#[tokio::test]
async fn test_remote_cancellation_end_to_end() {
    let Pair {
        left,
        right_server,
        ..
    } = pair();

    let signal = CancellationSignal::new();
    let call = {
        let left = left.clone();
        let signal = signal.clone();
        tokio::spawn(async move { left.call::<_, ()>("wait", &(), &signal).await })
    };

    timeout(WAIT, async {
        while right_server.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    signal.cancel();
    assert!(matches!(join(call).await, Err(RpcError::Canceled)));
    timeout(WAIT, async {
        while !right_server.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_closing_one_side_closes_the_other() {
    let Pair {
        left,
        right,
        right_server,
    } = pair();

    let pending = {
        let left = left.clone();
        tokio::spawn(async move {
            left.call::<_, ()>("wait", &(), &CancellationSignal::new())
                .await
        })
    };
    timeout(WAIT, async {
        while right_server.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    timeout(WAIT, right.close()).await.unwrap();
    timeout(WAIT, left.closed()).await.unwrap();
    assert!(matches!(join(pending).await, Err(RpcError::ConnectionClosed)));
    // Closing cancelled the handler still running on the closed side.
    timeout(WAIT, async {
        while !right_server.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[test]
fn test_dispose_outside_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (conn, _peer) = runtime.block_on(async {
        let (local, remote) = tokio::io::duplex(1024);
        (Connection::json(local, config()), remote)
    });

    conn.dispose();
    assert!(conn.is_closed());
    assert!(conn.name().starts_with("test "));
    assert_eq!(conn.name().len(), "test ".len() + 8);
}

#[test]
fn test_cancel_outside_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (conn, call, _peer) = runtime.block_on(async {
        let (local, remote) = tokio::io::duplex(1024);
        let conn = Connection::json(local, config());
        let call = spawn_call(&conn, "wait", Value::Null);
        while conn.pending_calls().is_empty() {
            tokio::task::yield_now().await;
        }
        (conn, call, remote)
    });

    let id = conn.pending_calls()[0];
    assert!(conn.cancel(id));
    assert!(!conn.is_closed());

    let result = runtime.block_on(call).unwrap();
    assert!(matches!(result, Err(RpcError::Canceled)));
}
