//! Script-side echo service used by the integration tests. Mirrors the
//! wire behavior the suite asserts on: unary echo with code 42, a
//! three-item server stream, a counting client stream, and a bidi echo.
#![allow(dead_code)]

use pontic::message::MessageValue;
use pontic::metadata::Metadata;
use pontic::module::GrpcModule;
use pontic::server::{ServerCall, ServiceHandlers};
use pontic::status::GrpcError;
use prost_reflect::{DescriptorPool, Value};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

pub struct EchoHarness {
    pub module: GrpcModule,
    /// Number of unary handler invocations.
    pub unary_calls: Arc<AtomicUsize>,
}

/// Builds a module with the echo service registered and started.
pub fn echo_module() -> EchoHarness {
    let module = pontic::module::module(echo_service::descriptor_pool()).unwrap();
    let unary_calls = Arc::new(AtomicUsize::new(0));
    let mut server = module.create_server();
    server
        .add_service(
            echo_service::SERVICE_NAME,
            echo_handlers(module.descriptor_pool().clone(), unary_calls.clone()),
        )
        .unwrap();
    server.start().unwrap();
    EchoHarness {
        module,
        unary_calls,
    }
}

/// The full echo handler table.
pub fn echo_handlers(pool: DescriptorPool, unary_calls: Arc<AtomicUsize>) -> ServiceHandlers {
    let unary_pool = pool.clone();
    let stream_pool = pool.clone();
    let aggregate_pool = pool.clone();
    let bidi_pool = pool.clone();
    ServiceHandlers::new()
        .unary("unaryEcho", move |request, call: ServerCall| {
            unary_calls.fetch_add(1, SeqCst);
            let pool = unary_pool.clone();
            async move {
                let text = text_field(&request, "message")?;
                if text == "slow" {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
                if let Some(value) = call.request_header().get("x-echo-header") {
                    let mut header = Metadata::new();
                    header.set("x-echo-header", [value]).unwrap();
                    call.set_header(&header)?;
                }
                let mut trailer = Metadata::new();
                trailer.set("x-handled-by", ["echo"]).unwrap();
                call.set_trailer(&trailer);

                let mut reply = new_message(&pool, echo_service::RESPONSE_TYPE)?;
                reply
                    .set("message", Value::String(format!("echo: {text}")))
                    .map_err(internal)?;
                reply.set("code", Value::I32(42)).map_err(internal)?;
                Ok(reply)
            }
        })
        .server_streaming("serverStreamingEcho", move |_request, call: ServerCall| {
            let pool = stream_pool.clone();
            async move {
                for i in 0..3 {
                    let mut item = new_message(&pool, echo_service::ITEM_TYPE)?;
                    item.set("id", Value::String(i.to_string())).map_err(internal)?;
                    item.set("name", Value::String(format!("item-{i}")))
                        .map_err(internal)?;
                    call.send(item).await?;
                }
                Ok(())
            }
        })
        .client_streaming("clientStreamingEcho", move |call: ServerCall| {
            let pool = aggregate_pool.clone();
            async move {
                let mut count = 0;
                loop {
                    let item = call.recv().await?;
                    if item.done {
                        break;
                    }
                    count += 1;
                }
                let mut reply = new_message(&pool, echo_service::RESPONSE_TYPE)?;
                reply
                    .set("message", Value::String(format!("count={count}")))
                    .map_err(internal)?;
                reply.set("code", Value::I32(count)).map_err(internal)?;
                Ok(reply)
            }
        })
        .bidi_streaming("bidirectionalEcho", move |call: ServerCall| {
            let pool = bidi_pool.clone();
            async move {
                loop {
                    let item = call.recv().await?;
                    let Some(request) = item.value else { break };
                    let text = text_field(&request, "message")?;
                    let mut reply = new_message(&pool, echo_service::RESPONSE_TYPE)?;
                    reply
                        .set("message", Value::String(format!("echo: {text}")))
                        .map_err(internal)?;
                    call.send(reply).await?;
                }
                Ok(())
            }
        })
}

/// A trivially valid handler table, useful as a base to override one
/// handler with a misbehaving variant.
pub fn stub_handlers(pool: DescriptorPool) -> ServiceHandlers {
    let unary_pool = pool.clone();
    let aggregate_pool = pool.clone();
    ServiceHandlers::new()
        .unary("unaryEcho", move |_request, _call| {
            let pool = unary_pool.clone();
            async move { new_message(&pool, echo_service::RESPONSE_TYPE) }
        })
        .server_streaming("serverStreamingEcho", |_request, _call| async { Ok(()) })
        .client_streaming("clientStreamingEcho", move |_call| {
            let pool = aggregate_pool.clone();
            async move { new_message(&pool, echo_service::RESPONSE_TYPE) }
        })
        .bidi_streaming("bidirectionalEcho", |_call| async { Ok(()) })
}

pub fn new_message(pool: &DescriptorPool, type_name: &str) -> Result<MessageValue, GrpcError> {
    let descriptor = pool
        .get_message_by_name(type_name)
        .ok_or_else(|| GrpcError::internal(format!("unknown type '{type_name}'")))?;
    Ok(MessageValue::new(descriptor))
}

pub fn text_field(message: &MessageValue, field: &str) -> Result<String, GrpcError> {
    match message.get(field).map_err(internal)? {
        Value::String(text) => Ok(text),
        other => Err(GrpcError::internal(format!(
            "expected a string in '{field}', got {other:?}"
        ))),
    }
}

pub fn internal(error: impl std::fmt::Display) -> GrpcError {
    GrpcError::internal(error.to_string())
}
