//! # Server call object
//!
//! The per-RPC handle passed to script handlers. It exposes the request
//! header metadata, the response header/trailer accumulators and, depending
//! on the RPC flavor, the `send`/`recv` stream endpoints. All of its methods
//! are meant to be used from handler code running on the loop; the channel
//! side only reads the accumulated state at settlement.
use crate::message::MessageValue;
use crate::metadata::Metadata;
use crate::status::GrpcError;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;

pub use crate::message::RecvItem;

/// One inbound frame request: the pump answers with the next message,
/// end-of-stream, or the terminal status.
pub(crate) type RecvReply = oneshot::Sender<Result<Option<DynamicMessage>, Status>>;

pub(crate) struct Outbound {
    pub(crate) frames: mpsc::Sender<Result<DynamicMessage, Status>>,
    pub(crate) headers: oneshot::Sender<Metadata>,
}

/// Per-RPC server-side call state shared between the handler and the
/// dispatcher.
#[derive(Clone)]
pub struct ServerCall {
    inner: Arc<CallShared>,
}

struct CallShared {
    request_header: Metadata,
    output_desc: MessageDescriptor,
    pool: DescriptorPool,
    state: Mutex<CallState>,
    inbound: Option<mpsc::Sender<RecvReply>>,
}

struct CallState {
    headers: Metadata,
    trailers: Metadata,
    headers_flushed: bool,
    outbound_frames: Option<mpsc::Sender<Result<DynamicMessage, Status>>>,
    outbound_headers: Option<oneshot::Sender<Metadata>>,
}

impl ServerCall {
    pub(crate) fn new(
        request_header: Metadata,
        output_desc: MessageDescriptor,
        pool: DescriptorPool,
        inbound: Option<mpsc::Sender<RecvReply>>,
        outbound: Option<Outbound>,
    ) -> Self {
        let (outbound_frames, outbound_headers) = match outbound {
            Some(outbound) => (Some(outbound.frames), Some(outbound.headers)),
            None => (None, None),
        };
        Self {
            inner: Arc::new(CallShared {
                request_header,
                output_desc,
                pool,
                state: Mutex::new(CallState {
                    headers: Metadata::new(),
                    trailers: Metadata::new(),
                    headers_flushed: false,
                    outbound_frames,
                    outbound_headers,
                }),
                inbound,
            }),
        }
    }

    /// The client's initial metadata.
    pub fn request_header(&self) -> Metadata {
        self.inner.request_header.clone()
    }

    /// Accumulates response header metadata; later entries merge. Fails once
    /// headers have already been flushed.
    pub fn set_header(&self, metadata: &Metadata) -> Result<(), GrpcError> {
        let mut state = self.lock();
        if state.headers_flushed {
            return Err(GrpcError::internal("response headers already sent"));
        }
        state.headers.merge(metadata);
        Ok(())
    }

    /// Accumulates response trailer metadata; later entries merge.
    pub fn set_trailer(&self, metadata: &Metadata) {
        self.lock().trailers.merge(metadata);
    }

    /// Eagerly flushes the accumulated headers. Idempotent.
    pub fn send_header(&self) {
        self.flush_headers();
    }

    /// Sends one response message. The returned future resolves once the
    /// frame is accepted for transmission. A wrong-typed message fails
    /// immediately without terminating the stream.
    pub async fn send(&self, message: MessageValue) -> Result<(), GrpcError> {
        let frames = {
            let state = self.lock();
            state.outbound_frames.clone()
        };
        let Some(frames) = frames else {
            return Err(GrpcError::internal("send is not available on this call"));
        };
        let dynamic = message
            .unwrap_for(&self.inner.output_desc)
            .map_err(|e| GrpcError::internal(e.to_string()))?;
        self.flush_headers();
        frames
            .send(Ok(dynamic))
            .await
            .map_err(|_| GrpcError::cancelled())
    }

    /// Receives the next request message, or `done` after half-close. After
    /// a terminal event every further call reports the same outcome.
    pub async fn recv(&self) -> Result<RecvItem, GrpcError> {
        let Some(inbound) = &self.inner.inbound else {
            return Err(GrpcError::internal("recv is not available on this call"));
        };
        let (tx, rx) = oneshot::channel();
        inbound.send(tx).await.map_err(|_| GrpcError::cancelled())?;
        match rx.await {
            Ok(Ok(Some(message))) => Ok(RecvItem {
                value: Some(MessageValue::wrap(message)),
                done: false,
            }),
            Ok(Ok(None)) => Ok(RecvItem {
                value: None,
                done: true,
            }),
            Ok(Err(status)) => Err(GrpcError::from_status(&status, &self.inner.pool)),
            Err(_) => Err(GrpcError::cancelled()),
        }
    }

    pub(crate) fn flush_headers(&self) {
        let mut state = self.lock();
        if state.headers_flushed {
            return;
        }
        state.headers_flushed = true;
        let headers = state.headers.clone();
        if let Some(tx) = state.outbound_headers.take() {
            let _ = tx.send(headers);
        }
    }

    /// Pushes the terminal error frame onto the response stream.
    pub(crate) async fn push_error(&self, status: Status) {
        let frames = {
            let state = self.lock();
            state.outbound_frames.clone()
        };
        if let Some(frames) = frames {
            let _ = frames.send(Err(status)).await;
        }
    }

    /// Ends the response stream regardless of lingering call clones.
    pub(crate) fn close_outbound(&self) {
        self.lock().outbound_frames.take();
    }

    pub(crate) fn headers_and_trailers(&self) -> (Metadata, Metadata) {
        let state = self.lock();
        (state.headers.clone(), state.trailers.clone())
    }

    pub(crate) fn trailers(&self) -> Metadata {
        self.lock().trailers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallState> {
        self.inner.state.lock().expect("server call lock")
    }
}
