//! # Server handler machinery
//!
//! Script code provides a handler table per service; [`ServerBuilder`]
//! validates it against the service descriptor (exactly one handler per
//! declared method, shapes matched to the streaming bits) and `start()`
//! installs one dispatcher per service on the in-process channel.
//!
//! Handlers are `Send + Sync` closures returning `!Send` futures: the
//! closures cross to the loop through the scheduler, and the futures they
//! mint never leave it.
pub mod call;
pub(crate) mod dispatch;

pub use call::{RecvItem, ServerCall};

use crate::channel::InProcessChannel;
use crate::message::MessageValue;
use crate::resolver::{Resolver, RpcFlavor, script_method_name};
use crate::sched::LoopHandle;
use crate::status::GrpcError;
use dispatch::ServiceDispatcher;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type HandlerFuture<T> = LocalBoxFuture<'static, Result<T, GrpcError>>;
pub type UnaryHandler =
    Arc<dyn Fn(MessageValue, ServerCall) -> HandlerFuture<MessageValue> + Send + Sync>;
pub type ServerStreamingHandler =
    Arc<dyn Fn(MessageValue, ServerCall) -> HandlerFuture<()> + Send + Sync>;
pub type ClientStreamingHandler =
    Arc<dyn Fn(ServerCall) -> HandlerFuture<MessageValue> + Send + Sync>;
pub type BidiStreamingHandler = Arc<dyn Fn(ServerCall) -> HandlerFuture<()> + Send + Sync>;

/// One handler, shaped like the RPC flavor it serves.
#[derive(Clone)]
pub enum Handler {
    Unary(UnaryHandler),
    ServerStreaming(ServerStreamingHandler),
    ClientStreaming(ClientStreamingHandler),
    BidiStreaming(BidiStreamingHandler),
}

impl Handler {
    fn flavor(&self) -> RpcFlavor {
        match self {
            Handler::Unary(_) => RpcFlavor::Unary,
            Handler::ServerStreaming(_) => RpcFlavor::ServerStreaming,
            Handler::ClientStreaming(_) => RpcFlavor::ClientStreaming,
            Handler::BidiStreaming(_) => RpcFlavor::BidiStreaming,
        }
    }
}

/// The handler table for one service, keyed by method name (script-side or
/// canonical).
#[derive(Clone, Default)]
pub struct ServiceHandlers {
    entries: HashMap<String, Handler>,
}

impl ServiceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unary<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(MessageValue, ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MessageValue, GrpcError>> + 'static,
    {
        self.entries.insert(
            method.to_string(),
            Handler::Unary(Arc::new(move |message, call| {
                handler(message, call).boxed_local()
            })),
        );
        self
    }

    pub fn server_streaming<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(MessageValue, ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GrpcError>> + 'static,
    {
        self.entries.insert(
            method.to_string(),
            Handler::ServerStreaming(Arc::new(move |message, call| {
                handler(message, call).boxed_local()
            })),
        );
        self
    }

    pub fn client_streaming<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MessageValue, GrpcError>> + 'static,
    {
        self.entries.insert(
            method.to_string(),
            Handler::ClientStreaming(Arc::new(move |call| handler(call).boxed_local())),
        );
        self
    }

    pub fn bidi_streaming<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GrpcError>> + 'static,
    {
        self.entries.insert(
            method.to_string(),
            Handler::BidiStreaming(Arc::new(move |call| handler(call).boxed_local())),
        );
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerBuildError {
    #[error(transparent)]
    Resolve(#[from] crate::resolver::ResolveError),
    #[error("missing handler for method '{method}' of service '{service}'")]
    MissingHandler { service: String, method: String },
    #[error(
        "handler for method '{method}' is shaped for {handler} but the method is {method_flavor}"
    )]
    FlavorMismatch {
        method: String,
        handler: &'static str,
        method_flavor: &'static str,
    },
    #[error("handler '{method}' does not match any method of service '{service}'")]
    UnknownMethod { service: String, method: String },
    #[error("already started")]
    AlreadyStarted,
    #[error(transparent)]
    AlreadyRegistered(#[from] crate::channel::AlreadyRegistered),
}

/// Builds and starts script-backed services.
pub struct ServerBuilder {
    resolver: Resolver,
    channel: InProcessChannel,
    sched: LoopHandle,
    services: Vec<(ServiceDescriptor, Vec<(MethodDescriptor, Handler)>)>,
    started: bool,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    pub(crate) fn new(resolver: Resolver, channel: InProcessChannel, sched: LoopHandle) -> Self {
        Self {
            resolver,
            channel,
            sched,
            services: Vec::new(),
            started: false,
        }
    }

    /// Binds a handler table to a service declared in the descriptor pool.
    /// Every method must have exactly one handler of the matching shape;
    /// entries that match no method are rejected too.
    pub fn add_service(
        &mut self,
        service: &str,
        handlers: ServiceHandlers,
    ) -> Result<&mut Self, ServerBuildError> {
        let descriptor = self.resolver.service(service)?;
        let mut remaining = handlers.entries;
        let mut bound = Vec::new();
        for method in descriptor.methods() {
            let handler = remaining
                .remove(&script_method_name(method.name()))
                .or_else(|| remaining.remove(method.name()))
                .ok_or_else(|| ServerBuildError::MissingHandler {
                    service: service.to_string(),
                    method: script_method_name(method.name()),
                })?;
            let method_flavor = RpcFlavor::of(&method);
            if handler.flavor() != method_flavor {
                return Err(ServerBuildError::FlavorMismatch {
                    method: script_method_name(method.name()),
                    handler: handler.flavor().describe(),
                    method_flavor: method_flavor.describe(),
                });
            }
            bound.push((method, handler));
        }
        if let Some(name) = remaining.into_keys().next() {
            return Err(ServerBuildError::UnknownMethod {
                service: service.to_string(),
                method: name,
            });
        }
        self.services.push((descriptor, bound));
        Ok(self)
    }

    /// Installs the dispatchers on the channel. May be called exactly once.
    pub fn start(&mut self) -> Result<(), ServerBuildError> {
        if self.started {
            return Err(ServerBuildError::AlreadyStarted);
        }
        self.started = true;
        for (descriptor, methods) in self.services.drain(..) {
            let dispatcher = ServiceDispatcher::new(
                descriptor.clone(),
                methods,
                self.sched.clone(),
                self.resolver.pool().clone(),
            );
            self.channel
                .register(descriptor.full_name(), dispatcher.into_route())?;
        }
        Ok(())
    }
}
