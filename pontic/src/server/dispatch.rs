//! # Channel-side dispatchers
//!
//! One dispatcher is installed on the channel per registered service. For
//! each incoming RPC it decodes frames with the dynamic codec, schedules the
//! script handler on the loop, and reports the handler's outcome (response,
//! headers, trailers, or error) back through the transport.
//!
//! The shape mirrors generated tonic servers: a path match selects a
//! per-method adapter implementing the matching `tonic::server` service
//! trait, driven by `tonic::server::Grpc` with the dynamic codec.
use super::call::{Outbound, RecvReply, ServerCall};
use super::{BidiStreamingHandler, ClientStreamingHandler, Handler, ServerStreamingHandler, UnaryHandler};
use crate::channel::codec::DynamicCodec;
use crate::channel::{RouteService, unimplemented_response};
use crate::message::MessageValue;
use crate::metadata::Metadata;
use crate::sched::LoopHandle;
use crate::status::GrpcError;
use futures_util::future::BoxFuture;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, ServiceDescriptor};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::Body;
use tonic::{Status, Streaming};
use tower::util::BoxCloneSyncService;

const OUTBOUND_BUFFER: usize = 16;

/// Routes the methods of one service to their script handlers.
#[derive(Clone)]
pub(crate) struct ServiceDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    service: ServiceDescriptor,
    methods: HashMap<String, MethodEntry>,
    sched: LoopHandle,
    pool: DescriptorPool,
}

struct MethodEntry {
    method: MethodDescriptor,
    handler: Handler,
}

impl ServiceDispatcher {
    pub(crate) fn new(
        service: ServiceDescriptor,
        methods: Vec<(MethodDescriptor, Handler)>,
        sched: LoopHandle,
        pool: DescriptorPool,
    ) -> Self {
        let methods = methods
            .into_iter()
            .map(|(method, handler)| {
                (method.name().to_string(), MethodEntry { method, handler })
            })
            .collect();
        Self {
            inner: Arc::new(DispatcherInner {
                service,
                methods,
                sched,
                pool,
            }),
        }
    }

    pub(crate) fn into_route(self) -> RouteService {
        BoxCloneSyncService::new(self)
    }
}

impl tower::Service<http::Request<Body>> for ServiceDispatcher {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let method_name = request
            .uri()
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let Some(entry) = self.inner.methods.get(&method_name) else {
            log::debug!(
                "no handler for '{}/{}'",
                self.inner.service.full_name(),
                method_name
            );
            return Box::pin(std::future::ready(Ok(unimplemented_response())));
        };

        log::trace!(
            "dispatching '{}/{}'",
            self.inner.service.full_name(),
            method_name
        );
        let method = entry.method.clone();
        let handler = entry.handler.clone();
        let sched = self.inner.sched.clone();
        let pool = self.inner.pool.clone();
        Box::pin(async move {
            let codec = DynamicCodec::server(&method);
            let mut grpc = tonic::server::Grpc::new(codec);
            let response = match handler {
                Handler::Unary(handler) => {
                    grpc.unary(UnaryDispatch { handler, method, sched, pool }, request)
                        .await
                }
                Handler::ServerStreaming(handler) => {
                    grpc.server_streaming(
                        ServerStreamingDispatch { handler, method, sched, pool },
                        request,
                    )
                    .await
                }
                Handler::ClientStreaming(handler) => {
                    grpc.client_streaming(
                        ClientStreamingDispatch { handler, method, sched, pool },
                        request,
                    )
                    .await
                }
                Handler::BidiStreaming(handler) => {
                    grpc.streaming(
                        BidiStreamingDispatch { handler, method, sched, pool },
                        request,
                    )
                    .await
                }
            };
            Ok(response)
        })
    }
}

fn loop_gone() -> Status {
    Status::unavailable("event loop not running")
}

/// Validates a handler's fulfillment value against the declared output type
/// and assembles the unary-shaped response. Headers and trailers travel
/// merged in the response metadata, which is how the transport delivers both
/// for single-message responses.
fn finish_unary(
    outcome: Result<MessageValue, GrpcError>,
    call: &ServerCall,
    method: &MethodDescriptor,
) -> Result<tonic::Response<DynamicMessage>, Status> {
    let (headers, trailers) = call.headers_and_trailers();
    match outcome {
        Ok(value) => match value.unwrap_for(&method.output()) {
            Ok(dynamic) => {
                let mut response = tonic::Response::new(dynamic);
                let mut metadata = headers;
                metadata.merge(&trailers);
                if let Ok(map) = metadata.to_tonic() {
                    *response.metadata_mut() = map;
                }
                Ok(response)
            }
            Err(error) => {
                Err(GrpcError::internal(error.to_string()).into_status_with_trailers(trailers))
            }
        },
        Err(error) => Err(error.into_status_with_trailers(trailers)),
    }
}

/// Spawns the pump that feeds inbound frames to `recv` callers, one request
/// at a time. After the stream's terminal event the pump keeps answering
/// with that same outcome deterministically.
fn spawn_inbound_pump(mut stream: Streaming<DynamicMessage>) -> mpsc::Sender<RecvReply> {
    let (tx, mut rx) = mpsc::channel::<RecvReply>(1);
    tokio::spawn(async move {
        let mut terminal: Option<Result<(), Status>> = None;
        while let Some(reply) = rx.recv().await {
            let outcome = match &terminal {
                Some(Ok(())) => Ok(None),
                Some(Err(status)) => Err(status.clone()),
                None => match stream.message().await {
                    Ok(Some(message)) => Ok(Some(message)),
                    Ok(None) => {
                        terminal = Some(Ok(()));
                        Ok(None)
                    }
                    Err(status) => {
                        terminal = Some(Err(status.clone()));
                        Err(status)
                    }
                },
            };
            let _ = reply.send(outcome);
        }
    });
    tx
}

struct UnaryDispatch {
    handler: UnaryHandler,
    method: MethodDescriptor,
    sched: LoopHandle,
    pool: DescriptorPool,
}

impl tonic::server::UnaryService<DynamicMessage> for UnaryDispatch {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<tonic::Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.handler.clone();
        let method = self.method.clone();
        let sched = self.sched.clone();
        let pool = self.pool.clone();
        Box::pin(async move {
            let (metadata, _, message) = request.into_parts();
            let call = ServerCall::new(
                Metadata::from_tonic(&metadata),
                method.output(),
                pool,
                None,
                None,
            );
            let (done_tx, done_rx) = oneshot::channel();
            let handler_call = call.clone();
            sched
                .submit(move || {
                    let fut = (handler)(MessageValue::wrap(message), handler_call);
                    tokio::task::spawn_local(async move {
                        let _ = done_tx.send(fut.await);
                    });
                })
                .map_err(|_| loop_gone())?;
            let outcome = done_rx.await.map_err(|_| loop_gone())?;
            finish_unary(outcome, &call, &method)
        })
    }
}

struct ServerStreamingDispatch {
    handler: ServerStreamingHandler,
    method: MethodDescriptor,
    sched: LoopHandle,
    pool: DescriptorPool,
}

impl tonic::server::ServerStreamingService<DynamicMessage> for ServerStreamingDispatch {
    type Response = DynamicMessage;
    type ResponseStream = ReceiverStream<Result<DynamicMessage, Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let handler = self.handler.clone();
        let method = self.method.clone();
        let sched = self.sched.clone();
        let pool = self.pool.clone();
        Box::pin(async move {
            let (metadata, _, message) = request.into_parts();
            let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_BUFFER);
            let (headers_tx, headers_rx) = oneshot::channel();
            let call = ServerCall::new(
                Metadata::from_tonic(&metadata),
                method.output(),
                pool,
                None,
                Some(Outbound {
                    frames: frames_tx,
                    headers: headers_tx,
                }),
            );
            let handler_call = call.clone();
            sched
                .submit(move || {
                    let fut = (handler)(MessageValue::wrap(message), handler_call.clone());
                    tokio::task::spawn_local(async move {
                        let outcome = fut.await;
                        settle_stream(&handler_call, outcome).await;
                    });
                })
                .map_err(|_| loop_gone())?;
            let headers = headers_rx.await.map_err(|_| loop_gone())?;
            let mut response = tonic::Response::new(ReceiverStream::new(frames_rx));
            if let Ok(map) = headers.to_tonic() {
                *response.metadata_mut() = map;
            }
            Ok(response)
        })
    }
}

/// Terminates a streaming response: headers are flushed even when the
/// handler never sent a message, the terminal error frame (with trailers)
/// follows any partial progress, and the stream is closed.
async fn settle_stream(call: &ServerCall, outcome: Result<(), GrpcError>) {
    call.flush_headers();
    if let Err(error) = outcome {
        let trailers = call.trailers();
        call.push_error(error.into_status_with_trailers(trailers)).await;
    }
    call.close_outbound();
}

struct ClientStreamingDispatch {
    handler: ClientStreamingHandler,
    method: MethodDescriptor,
    sched: LoopHandle,
    pool: DescriptorPool,
}

impl tonic::server::ClientStreamingService<DynamicMessage> for ClientStreamingDispatch {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<tonic::Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handler = self.handler.clone();
        let method = self.method.clone();
        let sched = self.sched.clone();
        let pool = self.pool.clone();
        Box::pin(async move {
            let (metadata, _, stream) = request.into_parts();
            let inbound = spawn_inbound_pump(stream);
            let call = ServerCall::new(
                Metadata::from_tonic(&metadata),
                method.output(),
                pool,
                Some(inbound),
                None,
            );
            let (done_tx, done_rx) = oneshot::channel();
            let handler_call = call.clone();
            sched
                .submit(move || {
                    let fut = (handler)(handler_call);
                    tokio::task::spawn_local(async move {
                        let _ = done_tx.send(fut.await);
                    });
                })
                .map_err(|_| loop_gone())?;
            let outcome = done_rx.await.map_err(|_| loop_gone())?;
            finish_unary(outcome, &call, &method)
        })
    }
}

struct BidiStreamingDispatch {
    handler: BidiStreamingHandler,
    method: MethodDescriptor,
    sched: LoopHandle,
    pool: DescriptorPool,
}

impl tonic::server::StreamingService<DynamicMessage> for BidiStreamingDispatch {
    type Response = DynamicMessage;
    type ResponseStream = ReceiverStream<Result<DynamicMessage, Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handler = self.handler.clone();
        let method = self.method.clone();
        let sched = self.sched.clone();
        let pool = self.pool.clone();
        Box::pin(async move {
            let (metadata, _, stream) = request.into_parts();
            let inbound = spawn_inbound_pump(stream);
            let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_BUFFER);
            let (headers_tx, headers_rx) = oneshot::channel();
            let call = ServerCall::new(
                Metadata::from_tonic(&metadata),
                method.output(),
                pool,
                Some(inbound),
                Some(Outbound {
                    frames: frames_tx,
                    headers: headers_tx,
                }),
            );
            let handler_call = call.clone();
            sched
                .submit(move || {
                    let fut = (handler)(handler_call.clone());
                    tokio::task::spawn_local(async move {
                        let outcome = fut.await;
                        settle_stream(&handler_call, outcome).await;
                    });
                })
                .map_err(|_| loop_gone())?;
            let headers = headers_rx.await.map_err(|_| loop_gone())?;
            let mut response = tonic::Response::new(ReceiverStream::new(frames_rx));
            if let Ok(map) = headers.to_tonic() {
                *response.metadata_mut() = map;
            }
            Ok(response)
        })
    }
}
