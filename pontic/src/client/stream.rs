//! # Client-side stream handles
//!
//! The script-facing endpoints of a streaming RPC. Each handle talks to the
//! task driving the call: `recv` posts a request the task answers with the
//! next frame, `send` pushes a frame through the outbound gate, and
//! `close_send` half-closes by dropping the gate. After the terminal event
//! every endpoint reports the same outcome deterministically.
use crate::message::{MessageValue, RecvItem};
use crate::status::GrpcError;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, oneshot};

/// A recv request answered by the driving task.
pub(crate) type RecvRequest = oneshot::Sender<Result<RecvItem, GrpcError>>;

/// Shared terminal outcome of a streaming RPC; set exactly once.
pub(crate) type TerminalCell = Arc<OnceLock<GrpcError>>;

/// The outbound half-duplex gate. Dropping the inner sender — by
/// `close_send` or by the driving task on a terminal event — half-closes
/// the request stream.
pub(crate) type OutboundGate = Arc<Mutex<Option<mpsc::Sender<DynamicMessage>>>>;

/// Receive endpoint of a server-streaming or bidi RPC.
pub struct ClientStream {
    pub(crate) requests: mpsc::Sender<RecvRequest>,
    pub(crate) terminal: TerminalCell,
}

impl ClientStream {
    /// The next message in delivery order, `done` on clean close, or the
    /// terminal error.
    pub async fn recv(&self) -> Result<RecvItem, GrpcError> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(tx).await.is_err() {
            return Err(self.terminal_error());
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> GrpcError {
        self.terminal
            .get()
            .cloned()
            .unwrap_or_else(GrpcError::cancelled)
    }
}

/// Send endpoint of a client-streaming or bidi RPC.
#[derive(Clone)]
pub struct StreamSender {
    pub(crate) gate: OutboundGate,
    pub(crate) input_desc: MessageDescriptor,
    pub(crate) terminal: TerminalCell,
}

impl StreamSender {
    /// Sends one message; resolves when the frame is accepted for
    /// transmission. A wrong-typed message fails without disturbing the
    /// stream.
    pub async fn send(&self, message: MessageValue) -> Result<(), GrpcError> {
        if let Some(error) = self.terminal.get() {
            return Err(error.clone());
        }
        let dynamic = message
            .unwrap_for(&self.input_desc)
            .map_err(|e| GrpcError::internal(e.to_string()))?;
        let sender = self.gate.lock().expect("outbound gate lock").clone();
        let Some(sender) = sender else {
            return Err(self.closed_error());
        };
        sender.send(dynamic).await.map_err(|_| self.closed_error())
    }

    /// Half-closes the request stream; resolves once no more frames can be
    /// queued. Receiving continues on the other side.
    pub async fn close_send(&self) -> Result<(), GrpcError> {
        self.gate.lock().expect("outbound gate lock").take();
        Ok(())
    }

    fn closed_error(&self) -> GrpcError {
        self.terminal
            .get()
            .cloned()
            .unwrap_or_else(|| GrpcError::internal("send after half-close"))
    }
}

/// The endpoints of a client-streaming RPC: the send half plus the single
/// terminal response promise.
pub struct ClientStreamCall {
    pub sender: StreamSender,
    pub response: crate::sched::Promise<MessageValue>,
}

impl ClientStreamCall {
    pub async fn send(&self, message: MessageValue) -> Result<(), GrpcError> {
        self.sender.send(message).await
    }

    pub async fn close_send(&self) -> Result<(), GrpcError> {
        self.sender.close_send().await
    }
}

/// The endpoints of a bidi RPC: send, close_send and recv are all usable
/// concurrently.
pub struct BidiCall {
    pub sender: StreamSender,
    pub stream: ClientStream,
}

impl BidiCall {
    pub async fn send(&self, message: MessageValue) -> Result<(), GrpcError> {
        self.sender.send(message).await
    }

    pub async fn close_send(&self) -> Result<(), GrpcError> {
        self.sender.close_send().await
    }

    pub async fn recv(&self) -> Result<RecvItem, GrpcError> {
        self.stream.recv().await
    }
}
