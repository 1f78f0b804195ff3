//! # Client call machinery
//!
//! Turns a script-side method invocation into a channel-hosted RPC. Each
//! call spawns its own task on the channel runtime; the task drives the
//! transport, races cancellation and the deadline, and reports header,
//! trailer and terminal events back to the loop through the scheduler — in
//! that order, always.
//!
//! The four flavors surface as:
//!
//! * `unary(name, message, opts)` → `Promise<MessageValue>`
//! * `server_streaming(name, message, opts)` → `Promise<ClientStream>`
//! * `client_streaming(name, opts)` → `Promise<ClientStreamCall>`
//! * `bidi_streaming(name, opts)` → `Promise<BidiCall>`
//!
//! Methods are addressed by script-side (`unaryEcho`) or canonical
//! (`UnaryEcho`) name; calling a method through the wrong flavor, passing a
//! wrong-typed request message, or passing unconvertible metadata fails
//! synchronously.
pub mod interceptor;
pub mod stream;

pub use interceptor::{Interceptor, Next, UnaryRequest};
pub use stream::{BidiCall, ClientStream, ClientStreamCall, StreamSender};

use crate::cancel::{AbortSignal, RpcContext};
use crate::channel::InProcessChannel;
use crate::channel::codec::DynamicCodec;
use crate::message::{MessageValue, RecvItem};
use crate::metadata::{Metadata, without_transport_entries};
use crate::resolver::{Resolver, RpcFlavor};
use crate::sched::{LoopHandle, Promise, PromiseResolver};
use crate::status::GrpcError;
use futures_util::FutureExt;
use http::uri::PathAndQuery;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, ServiceDescriptor};
use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use stream::{OutboundGate, RecvRequest, TerminalCell};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tonic::metadata::MetadataMap;

const OUTBOUND_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Resolve(#[from] crate::resolver::ResolveError),
    #[error("method '{method}' is {actual}; it cannot be called as {called}")]
    FlavorMismatch {
        method: String,
        actual: &'static str,
        called: &'static str,
    },
    #[error(transparent)]
    Message(#[from] crate::message::MessageError),
    #[error(transparent)]
    Metadata(#[from] crate::metadata::MetadataError),
    #[error("event loop not running")]
    LoopClosed,
}

/// A metadata-observation callback; invoked at most once, on the loop.
pub type MetadataCallback = Box<dyn FnOnce(Metadata) + Send>;

/// Per-call options.
#[derive(Default)]
pub struct CallOptions {
    /// Initial client metadata.
    pub metadata: Option<Metadata>,
    /// Cancellation signal shared with an [`crate::cancel::AbortController`].
    pub signal: Option<AbortSignal>,
    /// Millisecond deadline; `0` is unbounded.
    pub timeout_ms: u64,
    /// Observes the response header metadata.
    pub on_header: Option<MetadataCallback>,
    /// Observes the response trailer metadata; fires for every RPC that
    /// reached the channel, success or failure.
    pub on_trailer: Option<MetadataCallback>,
}

impl CallOptions {
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Accepts the plain-object metadata shape; non-conforming values are
    /// skipped the way [`Metadata::from_object`] skips them.
    pub fn with_metadata_object(mut self, value: &serde_json::Value) -> Self {
        self.metadata = Some(Metadata::from_object(value));
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_on_header(mut self, callback: impl FnOnce(Metadata) + Send + 'static) -> Self {
        self.on_header = Some(Box::new(callback));
        self
    }

    pub fn with_on_trailer(mut self, callback: impl FnOnce(Metadata) + Send + 'static) -> Self {
        self.on_trailer = Some(Box::new(callback));
        self
    }
}

/// Client construction options.
#[derive(Default)]
pub struct ClientOptions {
    /// Interceptors composing right-to-left; the first entry is outermost.
    pub interceptors: Vec<Interceptor>,
}

/// A client bound to one service of the descriptor pool. Method properties
/// dispatch by name through the four flavor entry points.
pub struct Client {
    service: ServiceDescriptor,
    resolver: Resolver,
    channel: InProcessChannel,
    runtime: Handle,
    sched: LoopHandle,
    interceptors: Vec<Interceptor>,
}

impl Client {
    pub(crate) fn new(
        service: ServiceDescriptor,
        resolver: Resolver,
        channel: InProcessChannel,
        runtime: Handle,
        sched: LoopHandle,
        options: ClientOptions,
    ) -> Self {
        Self {
            service,
            resolver,
            channel,
            runtime,
            sched,
            interceptors: options.interceptors,
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.full_name()
    }

    /// Unary call. The request runs through the interceptor chain before it
    /// is unwrapped and transmitted.
    pub fn unary(
        &self,
        method: &str,
        message: MessageValue,
        mut options: CallOptions,
    ) -> Result<Promise<MessageValue>, BindError> {
        let method = self.method_for(method, RpcFlavor::Unary)?;
        message.expect_type(&method.input())?;
        let header = options.metadata.take().unwrap_or_default();
        header.to_tonic()?;
        let observers = CallObservers::take_from(&mut options, self.sched.clone());
        let signal = options.signal.take();
        let timeout_ms = options.timeout_ms;
        let site = self.site(&method);
        let interceptors = self.interceptors.clone();
        let wire_method = format!("/{}/{}", self.service.full_name(), method.name());
        let (promise_resolver, promise) = self.sched.promise();

        self.sched
            .submit(move || {
                let terminal = unary_terminal(site, signal, timeout_ms, observers);
                let chain = interceptor::compose(&interceptors, terminal);
                let fut = chain(UnaryRequest {
                    method: wire_method,
                    header,
                    message: Some(message),
                });
                tokio::task::spawn_local(async move {
                    match fut.await {
                        Ok(value) => promise_resolver.resolve(value),
                        Err(error) => promise_resolver.reject(error),
                    }
                });
            })
            .map_err(|_| BindError::LoopClosed)?;
        Ok(promise)
    }

    /// Server-streaming call. The promise resolves once the stream is open;
    /// `recv` then delivers messages in order.
    pub fn server_streaming(
        &self,
        method: &str,
        message: MessageValue,
        mut options: CallOptions,
    ) -> Result<Promise<ClientStream>, BindError> {
        let method = self.method_for(method, RpcFlavor::ServerStreaming)?;
        message.expect_type(&method.input())?;
        let metadata = options.metadata.take().unwrap_or_default().to_tonic()?;
        let observers = CallObservers::take_from(&mut options, self.sched.clone());
        let (promise_resolver, promise) = self.sched.promise();
        let ctx = match RpcContext::attach(options.signal.as_ref(), options.timeout_ms) {
            Ok(ctx) => ctx,
            Err(_) => {
                promise_resolver.reject(GrpcError::cancelled());
                return Ok(promise);
            }
        };
        let site = self.site(&method);
        let message = message
            .unwrap_for(&method.input())
            .map_err(BindError::Message)?;
        self.runtime.spawn(run_server_streaming(
            site,
            ctx,
            metadata,
            message,
            observers,
            promise_resolver,
        ));
        Ok(promise)
    }

    /// Client-streaming call. The call object is available immediately;
    /// `response` is the terminal promise for the single server reply.
    pub fn client_streaming(
        &self,
        method: &str,
        mut options: CallOptions,
    ) -> Result<Promise<ClientStreamCall>, BindError> {
        let method = self.method_for(method, RpcFlavor::ClientStreaming)?;
        let metadata = options.metadata.take().unwrap_or_default().to_tonic()?;
        let observers = CallObservers::take_from(&mut options, self.sched.clone());
        let (promise_resolver, promise) = self.sched.promise();
        let ctx = match RpcContext::attach(options.signal.as_ref(), options.timeout_ms) {
            Ok(ctx) => ctx,
            Err(_) => {
                promise_resolver.reject(GrpcError::cancelled());
                return Ok(promise);
            }
        };
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let gate: OutboundGate = Arc::new(Mutex::new(Some(out_tx)));
        let terminal: TerminalCell = Arc::new(OnceLock::new());
        let (response_resolver, response) = self.sched.promise();
        promise_resolver.resolve(ClientStreamCall {
            sender: StreamSender {
                gate: gate.clone(),
                input_desc: method.input(),
                terminal: terminal.clone(),
            },
            response,
        });
        let site = self.site(&method);
        self.runtime.spawn(run_client_streaming(
            site,
            ctx,
            metadata,
            observers,
            out_rx,
            gate,
            terminal,
            response_resolver,
        ));
        Ok(promise)
    }

    /// Bidi call: `send`, `close_send` and `recv` are all available
    /// concurrently as soon as the promise resolves.
    pub fn bidi_streaming(
        &self,
        method: &str,
        mut options: CallOptions,
    ) -> Result<Promise<BidiCall>, BindError> {
        let method = self.method_for(method, RpcFlavor::BidiStreaming)?;
        let metadata = options.metadata.take().unwrap_or_default().to_tonic()?;
        let observers = CallObservers::take_from(&mut options, self.sched.clone());
        let (promise_resolver, promise) = self.sched.promise();
        let ctx = match RpcContext::attach(options.signal.as_ref(), options.timeout_ms) {
            Ok(ctx) => ctx,
            Err(_) => {
                promise_resolver.reject(GrpcError::cancelled());
                return Ok(promise);
            }
        };
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let gate: OutboundGate = Arc::new(Mutex::new(Some(out_tx)));
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let terminal: TerminalCell = Arc::new(OnceLock::new());
        promise_resolver.resolve(BidiCall {
            sender: StreamSender {
                gate: gate.clone(),
                input_desc: method.input(),
                terminal: terminal.clone(),
            },
            stream: ClientStream {
                requests: requests_tx,
                terminal: terminal.clone(),
            },
        });
        let site = self.site(&method);
        self.runtime.spawn(run_bidi(
            site,
            ctx,
            metadata,
            observers,
            out_rx,
            gate,
            requests_rx,
            terminal,
        ));
        Ok(promise)
    }

    fn method_for(&self, name: &str, called: RpcFlavor) -> Result<MethodDescriptor, BindError> {
        let method = self.resolver.method(&self.service, name)?;
        let actual = RpcFlavor::of(&method);
        if actual != called {
            return Err(BindError::FlavorMismatch {
                method: name.to_string(),
                actual: actual.describe(),
                called: called.describe(),
            });
        }
        Ok(method)
    }

    fn site(&self, method: &MethodDescriptor) -> CallSite {
        CallSite {
            channel: self.channel.clone(),
            method: method.clone(),
            pool: self.resolver.pool().clone(),
            sched: self.sched.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

/// Everything a call task needs from the client.
struct CallSite {
    channel: InProcessChannel,
    method: MethodDescriptor,
    pool: DescriptorPool,
    sched: LoopHandle,
    runtime: Handle,
}

fn http_path(method: &MethodDescriptor) -> PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    PathAndQuery::from_str(&path).expect("valid gRPC path")
}

/// Header/trailer observation callbacks for one RPC. Each fires at most
/// once, on the loop, with transport pseudo-entries stripped.
pub(crate) struct CallObservers {
    on_header: Option<MetadataCallback>,
    on_trailer: Option<MetadataCallback>,
    sched: LoopHandle,
}

impl CallObservers {
    fn take_from(options: &mut CallOptions, sched: LoopHandle) -> Self {
        Self {
            on_header: options.on_header.take(),
            on_trailer: options.on_trailer.take(),
            sched,
        }
    }

    pub(crate) fn header(&mut self, metadata: Metadata) {
        if let Some(callback) = self.on_header.take() {
            let metadata = without_transport_entries(&metadata);
            let _ = self.sched.submit(move || callback(metadata));
        }
    }

    pub(crate) fn trailer(&mut self, metadata: Metadata) {
        if let Some(callback) = self.on_trailer.take() {
            let metadata = without_transport_entries(&metadata);
            let _ = self.sched.submit(move || callback(metadata));
        }
    }
}

/// A call failure paired with whatever trailer metadata came with it.
type CallFailure = (GrpcError, Metadata);

fn status_failure(status: tonic::Status, pool: &DescriptorPool) -> CallFailure {
    let trailers = Metadata::from_tonic(status.metadata());
    (GrpcError::from_status(&status, pool), trailers)
}

/// The terminal function of the unary interceptor onion: consumes the
/// request's header and message and starts the channel-side task.
fn unary_terminal(
    site: CallSite,
    signal: Option<AbortSignal>,
    timeout_ms: u64,
    observers: CallObservers,
) -> Next {
    let state = Rc::new(RefCell::new(Some((site, signal, timeout_ms, observers))));
    Rc::new(move |request: UnaryRequest| {
        let state = state.clone();
        async move {
            let Some((site, signal, timeout_ms, observers)) = state.borrow_mut().take() else {
                return Err(GrpcError::internal("RPC already dispatched"));
            };
            let ctx = match RpcContext::attach(signal.as_ref(), timeout_ms) {
                Ok(ctx) => ctx,
                Err(_) => return Err(GrpcError::cancelled()),
            };
            let input = site.method.input();
            let message = match request.message {
                Some(value) => value
                    .unwrap_for(&input)
                    .map_err(|e| GrpcError::internal(e.to_string()))?,
                None => DynamicMessage::new(input),
            };
            let metadata = request
                .header
                .to_tonic()
                .map_err(|e| GrpcError::internal(e.to_string()))?;
            let (done_tx, done_rx) = oneshot::channel();
            site.runtime
                .clone()
                .spawn(run_unary(site, ctx, metadata, message, observers, done_tx));
            done_rx
                .await
                .unwrap_or_else(|_| Err(GrpcError::internal("event loop not running")))
        }
        .boxed_local()
    })
}

async fn run_unary(
    site: CallSite,
    ctx: RpcContext,
    metadata: MetadataMap,
    message: DynamicMessage,
    mut observers: CallObservers,
    done: oneshot::Sender<Result<MessageValue, GrpcError>>,
) {
    let deadline = ctx.deadline_elapsed();
    tokio::pin!(deadline);
    let call = async {
        let mut grpc = tonic::client::Grpc::new(site.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| (GrpcError::internal(format!("channel not ready: {e}")), Metadata::new()))?;
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = metadata;
        grpc.unary(
            request,
            http_path(&site.method),
            DynamicCodec::client(&site.method),
        )
        .await
        .map_err(|status| status_failure(status, &site.pool))
    };
    tokio::pin!(call);
    let outcome = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err((GrpcError::cancelled(), Metadata::new())),
        _ = &mut deadline => Err((GrpcError::deadline_exceeded(), Metadata::new())),
        result = &mut call => result,
    };
    ctx.release();
    match outcome {
        Ok(response) => {
            // The transport merges headers and trailers for single-message
            // responses; both observations see the same mapping.
            let merged = Metadata::from_tonic(response.metadata());
            observers.header(merged.clone());
            observers.trailer(merged);
            site.sched
                .deliver(done, Ok(MessageValue::wrap(response.into_inner())));
        }
        Err((error, trailers)) => {
            log::debug!("unary '{}' failed: {error}", site.method.full_name());
            observers.trailer(trailers);
            site.sched.deliver(done, Err(error));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_server_streaming(
    site: CallSite,
    ctx: RpcContext,
    metadata: MetadataMap,
    message: DynamicMessage,
    mut observers: CallObservers,
    promise_resolver: PromiseResolver<ClientStream>,
) {
    let (requests_tx, requests_rx) = mpsc::channel(1);
    let terminal: TerminalCell = Arc::new(OnceLock::new());
    let deadline = ctx.deadline_elapsed();
    tokio::pin!(deadline);
    let open = async {
        let mut grpc = tonic::client::Grpc::new(site.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| (GrpcError::internal(format!("channel not ready: {e}")), Metadata::new()))?;
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = metadata;
        grpc.server_streaming(
            request,
            http_path(&site.method),
            DynamicCodec::client(&site.method),
        )
        .await
        .map_err(|status| status_failure(status, &site.pool))
    };
    tokio::pin!(open);
    let opened = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err((GrpcError::cancelled(), Metadata::new())),
        _ = deadline.as_mut() => Err((GrpcError::deadline_exceeded(), Metadata::new())),
        result = &mut open => result,
    };
    match opened {
        Ok(response) => {
            observers.header(Metadata::from_tonic(response.metadata()));
            let streaming = response.into_inner();
            promise_resolver.resolve(ClientStream {
                requests: requests_tx,
                terminal: terminal.clone(),
            });
            serve_stream(
                &ctx,
                deadline,
                streaming,
                requests_rx,
                &mut observers,
                &terminal,
                None,
                &site.pool,
                &site.sched,
            )
            .await;
        }
        Err((error, trailers)) => {
            ctx.release();
            terminal.set(error.clone()).ok();
            observers.trailer(trailers);
            promise_resolver.reject(error);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client_streaming(
    site: CallSite,
    ctx: RpcContext,
    metadata: MetadataMap,
    mut observers: CallObservers,
    out_rx: mpsc::Receiver<DynamicMessage>,
    gate: OutboundGate,
    terminal: TerminalCell,
    response_resolver: PromiseResolver<MessageValue>,
) {
    let call = async {
        let mut grpc = tonic::client::Grpc::new(site.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| (GrpcError::internal(format!("channel not ready: {e}")), Metadata::new()))?;
        let mut request = tonic::Request::new(ReceiverStream::new(out_rx));
        *request.metadata_mut() = metadata;
        grpc.client_streaming(
            request,
            http_path(&site.method),
            DynamicCodec::client(&site.method),
        )
        .await
        .map_err(|status| status_failure(status, &site.pool))
    };
    tokio::pin!(call);
    let outcome = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err((GrpcError::cancelled(), Metadata::new())),
        _ = ctx.deadline_elapsed() => Err((GrpcError::deadline_exceeded(), Metadata::new())),
        result = &mut call => result,
    };
    ctx.release();
    close_gate(&gate);
    match outcome {
        Ok(response) => {
            let merged = Metadata::from_tonic(response.metadata());
            observers.header(merged.clone());
            observers.trailer(merged);
            response_resolver.resolve(MessageValue::wrap(response.into_inner()));
        }
        Err((error, trailers)) => {
            terminal.set(error.clone()).ok();
            observers.trailer(trailers);
            response_resolver.reject(error);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_bidi(
    site: CallSite,
    ctx: RpcContext,
    metadata: MetadataMap,
    mut observers: CallObservers,
    out_rx: mpsc::Receiver<DynamicMessage>,
    gate: OutboundGate,
    mut requests_rx: mpsc::Receiver<RecvRequest>,
    terminal: TerminalCell,
) {
    let deadline = ctx.deadline_elapsed();
    tokio::pin!(deadline);
    let open = async {
        let mut grpc = tonic::client::Grpc::new(site.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| (GrpcError::internal(format!("channel not ready: {e}")), Metadata::new()))?;
        let mut request = tonic::Request::new(ReceiverStream::new(out_rx));
        *request.metadata_mut() = metadata;
        grpc.streaming(
            request,
            http_path(&site.method),
            DynamicCodec::client(&site.method),
        )
        .await
        .map_err(|status| status_failure(status, &site.pool))
    };
    tokio::pin!(open);
    let opened = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err((GrpcError::cancelled(), Metadata::new())),
        _ = deadline.as_mut() => Err((GrpcError::deadline_exceeded(), Metadata::new())),
        result = &mut open => result,
    };
    match opened {
        Ok(response) => {
            observers.header(Metadata::from_tonic(response.metadata()));
            let streaming = response.into_inner();
            serve_stream(
                &ctx,
                deadline,
                streaming,
                requests_rx,
                &mut observers,
                &terminal,
                Some(&gate),
                &site.pool,
                &site.sched,
            )
            .await;
        }
        Err((error, trailers)) => {
            ctx.release();
            terminal.set(error.clone()).ok();
            close_gate(&gate);
            observers.trailer(trailers);
            // The script already holds the call object; keep answering its
            // recv requests with the terminal outcome.
            while let Some(reply) = requests_rx.recv().await {
                site.sched.deliver(reply, Err(error.clone()));
            }
        }
    }
}

fn close_gate(gate: &OutboundGate) {
    gate.lock().expect("outbound gate lock").take();
}

/// Serves `recv` requests for an open response stream until the script
/// drops its handle. After the terminal event every request is answered
/// with that same outcome.
#[allow(clippy::too_many_arguments)]
async fn serve_stream<D: Future<Output = ()>>(
    ctx: &RpcContext,
    mut deadline: Pin<&mut D>,
    streaming: Streaming<DynamicMessage>,
    mut requests: mpsc::Receiver<RecvRequest>,
    observers: &mut CallObservers,
    terminal: &TerminalCell,
    gate: Option<&OutboundGate>,
    pool: &DescriptorPool,
    sched: &LoopHandle,
) {
    enum Step {
        Cancelled,
        DeadlineExceeded,
        Item(Result<Option<DynamicMessage>, tonic::Status>),
    }

    #[allow(clippy::too_many_arguments)]
    fn note_terminal(
        ctx: &RpcContext,
        outcome: &mut Option<Result<(), GrpcError>>,
        result: Result<(), GrpcError>,
        trailers: Metadata,
        stream: &mut Option<Streaming<DynamicMessage>>,
        observers: &mut CallObservers,
        terminal: &TerminalCell,
        gate: Option<&OutboundGate>,
    ) {
        ctx.release();
        if let Err(error) = &result {
            terminal.set(error.clone()).ok();
        }
        if let Some(gate) = gate {
            close_gate(gate);
        }
        stream.take();
        observers.trailer(trailers);
        *outcome = Some(result);
    }

    let mut stream = Some(streaming);
    let mut outcome: Option<Result<(), GrpcError>> = None;

    while let Some(reply) = requests.recv().await {
        match &outcome {
            Some(Ok(())) => sched.deliver(
                reply,
                Ok(RecvItem {
                    value: None,
                    done: true,
                }),
            ),
            Some(Err(error)) => sched.deliver(reply, Err(error.clone())),
            None => {
                let step = {
                    let active = stream.as_mut().expect("stream active before terminal");
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => Step::Cancelled,
                        _ = deadline.as_mut() => Step::DeadlineExceeded,
                        item = active.message() => Step::Item(item),
                    }
                };
                match step {
                    Step::Cancelled => {
                        let error = GrpcError::cancelled();
                        note_terminal(
                            ctx,
                            &mut outcome,
                            Err(error.clone()),
                            Metadata::new(),
                            &mut stream,
                            observers,
                            terminal,
                            gate,
                        );
                        sched.deliver(reply, Err(error));
                    }
                    Step::DeadlineExceeded => {
                        let error = GrpcError::deadline_exceeded();
                        note_terminal(
                            ctx,
                            &mut outcome,
                            Err(error.clone()),
                            Metadata::new(),
                            &mut stream,
                            observers,
                            terminal,
                            gate,
                        );
                        sched.deliver(reply, Err(error));
                    }
                    Step::Item(Ok(Some(message))) => sched.deliver(
                        reply,
                        Ok(RecvItem {
                            value: Some(MessageValue::wrap(message)),
                            done: false,
                        }),
                    ),
                    Step::Item(Ok(None)) => {
                        let trailers = match stream
                            .as_mut()
                            .expect("stream active before terminal")
                            .trailers()
                            .await
                        {
                            Ok(Some(map)) => Metadata::from_tonic(&map),
                            _ => Metadata::new(),
                        };
                        note_terminal(
                            ctx,
                            &mut outcome,
                            Ok(()),
                            trailers,
                            &mut stream,
                            observers,
                            terminal,
                            gate,
                        );
                        sched.deliver(
                            reply,
                            Ok(RecvItem {
                                value: None,
                                done: true,
                            }),
                        );
                    }
                    Step::Item(Err(status)) => {
                        let (error, trailers) = status_failure(status, pool);
                        note_terminal(
                            ctx,
                            &mut outcome,
                            Err(error.clone()),
                            trailers,
                            &mut stream,
                            observers,
                            terminal,
                            gate,
                        );
                        sched.deliver(reply, Err(error));
                    }
                }
            }
        }
    }

    if outcome.is_none() {
        // The script dropped its stream handle before the terminal event,
        // abandoning the RPC.
        terminal.set(GrpcError::cancelled()).ok();
        if let Some(gate) = gate {
            close_gate(gate);
        }
        observers.trailer(Metadata::new());
    }
}
