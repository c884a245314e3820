//! A dispatcher over a static table of operations.
//!
//! A [`ServiceRegistry`] is built once at startup and shared; each
//! connection gets its own [`Server`], which tracks the requests it is
//! running so the peer can cancel them.

use crate::body::{BodyReader, OutboundBody};
use crate::cancel::CancellationSignal;
use crate::dispatcher::{Dispatcher, Reply};
use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use tandem_protocol::{Codec, ErrorChain, JsonCodec, Request};
use thiserror::Error;

/// How an operation exchanges data with its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Arguments in, value out.
    Unary,
    /// Arguments plus a request body in, value out.
    Upload,
    /// Arguments in, response body out.
    Download,
    /// Arguments in, nothing sent back.
    OneWay,
}

/// Static description of a registered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    pub kind: OperationKind,
    /// Rust type the arguments decode into.
    pub arguments: &'static str,
    /// Rust type of the result value, if any.
    pub result: &'static str,
}

/// Everything a handler receives for one request.
#[derive(Debug)]
pub struct Invocation<V> {
    pub request_id: u64,
    pub arguments: Vec<V>,
    pub body: Option<BodyReader>,
    /// Fires when the peer cancels the request or the connection closes.
    pub cancel: CancellationSignal,
}

type ReplyFuture<V> = BoxFuture<'static, Reply<V>>;

type Handler<C> =
    Arc<dyn Fn(C, Invocation<<C as Codec>::Value>) -> ReplyFuture<<C as Codec>::Value> + Send + Sync>;

struct Operation<C: Codec> {
    descriptor: OperationDescriptor,
    handler: Handler<C>,
}

/// Registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation '{0}' is already registered")]
    Duplicate(String),

    #[error("operation name must not be empty")]
    EmptyName,
}

/// Operations a [`Server`] can run, keyed by name.
pub struct ServiceRegistry<C: Codec = JsonCodec> {
    codec: C,
    operations: HashMap<String, Operation<C>>,
}

impl<C: Codec> ServiceRegistry<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            operations: HashMap::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Registers an operation that returns a value.
    pub fn unary<A, R, E, F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self, RegistryError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: StdError + Send + 'static,
        F: Fn(A, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let descriptor = describe::<A, R>(name, OperationKind::Unary);
        self.insert(
            descriptor,
            Arc::new(move |codec: C, invocation: Invocation<C::Value>| -> ReplyFuture<C::Value> {
                match codec.from_arguments::<A>(invocation.arguments) {
                    Ok(args) => value_reply(codec, handler(args, invocation.cancel)),
                    Err(err) => future::ready(Reply::fault(&err)).boxed(),
                }
            }),
        )
    }

    /// Registers an operation that consumes a request body.
    pub fn upload<A, R, E, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: StdError + Send + 'static,
        F: Fn(A, BodyReader, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let descriptor = describe::<A, R>(name, OperationKind::Upload);
        self.insert(
            descriptor,
            Arc::new(move |codec: C, invocation: Invocation<C::Value>| -> ReplyFuture<C::Value> {
                let Some(body) = invocation.body else {
                    return future::ready(Reply::Fault(missing_body())).boxed();
                };
                match codec.from_arguments::<A>(invocation.arguments) {
                    Ok(args) => value_reply(codec, handler(args, body, invocation.cancel)),
                    Err(err) => future::ready(Reply::fault(&err)).boxed(),
                }
            }),
        )
    }

    /// Registers an operation that answers with a body.
    pub fn download<A, E, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        A: DeserializeOwned + 'static,
        E: StdError + Send + 'static,
        F: Fn(A, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutboundBody, E>> + Send + 'static,
    {
        let descriptor = describe::<A, OutboundBody>(name, OperationKind::Download);
        self.insert(
            descriptor,
            Arc::new(move |codec: C, invocation: Invocation<C::Value>| -> ReplyFuture<C::Value> {
                match codec.from_arguments::<A>(invocation.arguments) {
                    Ok(args) => {
                        let pending = handler(args, invocation.cancel);
                        async move {
                            match pending.await {
                                Ok(body) => Reply::Download(body),
                                Err(err) => Reply::fault(&err),
                            }
                        }
                        .boxed()
                    }
                    Err(err) => future::ready(Reply::fault(&err)).boxed(),
                }
            }),
        )
    }

    /// Registers an operation whose caller expects no answer.
    pub fn one_way<A, F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self, RegistryError>
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let descriptor = describe::<A, ()>(name, OperationKind::OneWay);
        self.insert(
            descriptor,
            Arc::new(move |codec: C, invocation: Invocation<C::Value>| -> ReplyFuture<C::Value> {
                match codec.from_arguments::<A>(invocation.arguments) {
                    Ok(args) => handler(args).map(|()| Reply::NoReply).boxed(),
                    Err(err) => {
                        tracing::warn!("Dropping one-way request {}: {}", invocation.request_id, err);
                        future::ready(Reply::NoReply).boxed()
                    }
                }
            }),
        )
    }

    pub fn get(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name).map(|op| &op.descriptor)
    }

    /// All registered operations, sorted by name.
    pub fn descriptors(&self) -> Vec<&OperationDescriptor> {
        let mut all: Vec<_> = self.operations.values().map(|op| &op.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn insert(
        &mut self,
        descriptor: OperationDescriptor,
        handler: Handler<C>,
    ) -> Result<&mut Self, RegistryError> {
        if descriptor.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.operations.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        self.operations.insert(
            descriptor.name.clone(),
            Operation {
                descriptor,
                handler,
            },
        );
        Ok(self)
    }
}

impl<C: Codec + Default> Default for ServiceRegistry<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C: Codec> std::fmt::Debug for ServiceRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("codec", &self.codec.name())
            .field("operations", &self.descriptors())
            .finish()
    }
}

fn describe<A, R>(name: &str, kind: OperationKind) -> OperationDescriptor {
    OperationDescriptor {
        name: name.to_string(),
        kind,
        arguments: std::any::type_name::<A>(),
        result: std::any::type_name::<R>(),
    }
}

fn value_reply<C, R, E, Fut>(codec: C, pending: Fut) -> ReplyFuture<C::Value>
where
    C: Codec,
    R: Serialize + 'static,
    E: StdError + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    async move {
        match pending.await {
            Ok(result) => match codec.to_value(&result) {
                Ok(value) => Reply::Success(value),
                Err(err) => Reply::fault(&err),
            },
            Err(err) => Reply::fault(&err),
        }
    }
    .boxed()
}

fn missing_body() -> ErrorChain {
    ErrorChain::new("MissingBody", "operation expects a request body")
}

/// Serves one connection from a shared registry.
pub struct Server<C: Codec = JsonCodec> {
    registry: Arc<ServiceRegistry<C>>,
    in_flight: Arc<DashMap<u64, CancellationSignal>>,
}

impl<C: Codec> Server<C> {
    pub fn new(registry: Arc<ServiceRegistry<C>>) -> Self {
        Self {
            registry,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Ids of requests currently running.
    pub fn in_flight(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}

/// Forgets an in-flight request however its handler ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<u64, CancellationSignal>>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

impl<C: Codec> Dispatcher<C::Value> for Server<C> {
    fn on_request(
        &self,
        request: Request<C::Value>,
        body: Option<BodyReader>,
    ) -> ReplyFuture<C::Value> {
        let Some(operation) = self.registry.operations.get(&request.operation) else {
            tracing::warn!("Unknown operation '{}' (id={})", request.operation, request.id);
            let chain = ErrorChain::new(
                "UnknownOperation",
                format!("operation '{}' is not registered", request.operation),
            );
            return future::ready(Reply::Fault(chain)).boxed();
        };

        let kind = operation.descriptor.kind;
        if body.is_some() && kind != OperationKind::Upload {
            // Dropping the body lets the connection skip it.
            let chain = ErrorChain::new(
                "UnexpectedBody",
                format!("operation '{}' does not accept a request body", request.operation),
            );
            return future::ready(Reply::Fault(chain)).boxed();
        }

        let cancel = CancellationSignal::new();
        self.in_flight.insert(request.id, cancel.clone());
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            id: request.id,
        };

        let invocation = Invocation {
            request_id: request.id,
            arguments: request.arguments,
            body,
            cancel,
        };
        let running = (operation.handler)(self.registry.codec.clone(), invocation);
        async move {
            let reply = running.await;
            drop(guard);
            reply
        }
        .boxed()
    }

    fn on_cancellation(&self, request_id: u64) {
        let signal = self.in_flight.get(&request_id).map(|entry| entry.value().clone());
        match signal {
            Some(signal) => {
                signal.cancel();
            }
            None => tracing::debug!("Cancellation for idle id={}", request_id),
        }
    }

    fn on_connection_closed(&self) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
    }
}
