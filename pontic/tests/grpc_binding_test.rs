//! End-to-end coverage of the binding: the four RPC flavors, metadata and
//! status propagation, cancellation, deadlines, and the interceptor onion —
//! all driven as script code through the module's loop.
mod echo_service_impl;

use echo_service_impl::{echo_module, new_message, stub_handlers, text_field};
use pontic::cancel::AbortController;
use pontic::client::{CallOptions, ClientOptions, ClientStreamCall, Interceptor};
use pontic::message::MessageValue;
use pontic::metadata::Metadata;
use pontic::module::module;
use pontic::server::ServiceHandlers;
use pontic::status::{GrpcError, code};
use futures_util::FutureExt;
use prost_reflect::Value;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};

fn request_with_message(module: &pontic::module::GrpcModule, text: &str) -> MessageValue {
    let mut request = module.message(echo_service::REQUEST_TYPE).unwrap();
    request
        .set("message", Value::String(text.to_string()))
        .unwrap();
    request
}

#[test]
fn unary_happy_path() {
    let harness = echo_module();
    let module = harness.module.clone();
    let reply = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let request = request_with_message(&module, "hello");
                client
                    .unary("unaryEcho", request, CallOptions::default())
                    .unwrap()
                    .await
            }
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        reply.get("message").unwrap(),
        Value::String("echo: hello".into())
    );
    assert_eq!(reply.get("code").unwrap(), Value::I32(42));
    assert_eq!(harness.unary_calls.load(SeqCst), 1);
}

#[test]
fn pre_aborted_unary_rejects_without_reaching_the_handler() {
    let harness = echo_module();
    let module = harness.module.clone();
    let controller = AbortController::new();
    controller.abort();
    let signal = controller.signal();
    let error = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let request = request_with_message(&module, "hello");
                client
                    .unary(
                        "unaryEcho",
                        request,
                        CallOptions::default().with_signal(signal),
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::CANCELLED);
    assert_eq!(error.name(), "GrpcError");
    assert_eq!(harness.unary_calls.load(SeqCst), 0);
    assert_eq!(controller.signal().listener_count(), 0);
}

#[test]
fn server_stream_delivers_three_items_in_order_then_done() {
    let harness = echo_module();
    let module = harness.module.clone();
    let items = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let request = request_with_message(&module, "stream");
                let stream = client
                    .server_streaming("serverStreamingEcho", request, CallOptions::default())
                    .unwrap()
                    .await
                    .unwrap();
                let mut items = Vec::new();
                loop {
                    let item = stream.recv().await.unwrap();
                    match item.value {
                        Some(value) => items.push((
                            text_field(&value, "id").unwrap(),
                            text_field(&value, "name").unwrap(),
                        )),
                        None => {
                            assert!(item.done);
                            break;
                        }
                    }
                }
                // The terminal outcome is sticky.
                assert!(stream.recv().await.unwrap().done);
                items
            }
        })
        .unwrap();
    assert_eq!(
        items,
        vec![
            ("0".to_string(), "item-0".to_string()),
            ("1".to_string(), "item-1".to_string()),
            ("2".to_string(), "item-2".to_string()),
        ]
    );
}

#[test]
fn client_stream_aggregates_three_items() {
    let harness = echo_module();
    let module = harness.module.clone();
    let reply = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let ClientStreamCall { sender, response } = client
                    .client_streaming("clientStreamingEcho", CallOptions::default())
                    .unwrap()
                    .await
                    .unwrap();
                for i in 0..3 {
                    let mut item = module.message(echo_service::ITEM_TYPE).unwrap();
                    item.set("id", Value::String(i.to_string())).unwrap();
                    sender.send(item).await.unwrap();
                }
                sender.close_send().await.unwrap();
                response.await
            }
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        reply.get("message").unwrap(),
        Value::String("count=3".into())
    );
    assert_eq!(reply.get("code").unwrap(), Value::I32(3));
}

#[test]
fn bidi_echo_then_abort_poisons_both_endpoints() {
    let harness = echo_module();
    let module = harness.module.clone();
    let controller = AbortController::new();
    let (first_echo, recv_code, send_code) = module
        .run({
            let module = module.clone();
            let controller = controller.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let call = client
                    .bidi_streaming(
                        "bidirectionalEcho",
                        CallOptions::default().with_signal(controller.signal()),
                    )
                    .unwrap()
                    .await
                    .unwrap();
                call.send(request_with_message(&module, "ping")).await.unwrap();
                let first = call.recv().await.unwrap();
                let first_echo =
                    text_field(first.value.as_ref().unwrap(), "message").unwrap();

                controller.abort();
                let recv_err = call.recv().await.unwrap_err();
                let send_err = call
                    .send(request_with_message(&module, "after-abort"))
                    .await
                    .unwrap_err();
                (first_echo, recv_err.code, send_err.code)
            }
        })
        .unwrap();
    assert_eq!(first_echo, "echo: ping");
    assert_eq!(recv_code, code::CANCELLED);
    assert_eq!(send_code, code::CANCELLED);
    assert_eq!(controller.signal().listener_count(), 0);
}

#[test]
fn interceptors_run_as_an_onion_around_the_rpc() {
    let harness = echo_module();
    let module = harness.module.clone();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let interceptors = vec![
        tracing_interceptor("first", trace.clone()),
        tracing_interceptor("second", trace.clone()),
    ];
    let reply = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(
                        echo_service::SERVICE_NAME,
                        ClientOptions { interceptors },
                    )
                    .unwrap();
                let request = request_with_message(&module, "traced");
                client
                    .unary("unaryEcho", request, CallOptions::default())
                    .unwrap()
                    .await
            }
        })
        .unwrap()
        .unwrap();
    assert_eq!(
        reply.get("message").unwrap(),
        Value::String("echo: traced".into())
    );
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["first-before", "second-before", "second-after", "first-after"]
    );
}

fn tracing_interceptor(tag: &str, trace: Arc<Mutex<Vec<String>>>) -> Interceptor {
    let tag = tag.to_string();
    Arc::new(move |request, next| {
        let tag = tag.clone();
        let trace = trace.clone();
        async move {
            trace.lock().unwrap().push(format!("{tag}-before"));
            let response = next(request).await;
            trace.lock().unwrap().push(format!("{tag}-after"));
            response
        }
        .boxed_local()
    })
}

#[test]
fn deadline_expiry_is_observed_as_deadline_exceeded() {
    let harness = echo_module();
    let module = harness.module.clone();
    let error = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let request = request_with_message(&module, "slow");
                client
                    .unary(
                        "unaryEcho",
                        request,
                        CallOptions::default().with_timeout_ms(25),
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::DEADLINE_EXCEEDED);
}

#[test]
fn aborting_one_signal_does_not_disturb_other_rpcs() {
    let harness = echo_module();
    let module = harness.module.clone();
    let aborted = AbortController::new();
    let untouched = AbortController::new();
    let (slow_outcome, normal_outcome) = module
        .run({
            let module = module.clone();
            let aborted = aborted.clone();
            let untouched_signal = untouched.signal();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let slow = client
                    .unary(
                        "unaryEcho",
                        request_with_message(&module, "slow"),
                        CallOptions::default().with_signal(aborted.signal()),
                    )
                    .unwrap();
                let normal = client
                    .unary(
                        "unaryEcho",
                        request_with_message(&module, "quick"),
                        CallOptions::default().with_signal(untouched_signal),
                    )
                    .unwrap();
                aborted.abort();
                (slow.await, normal.await)
            }
        })
        .unwrap();
    // A race between completion and abort must resolve to one of the two
    // defined outcomes; with a 200ms handler delay it is cancellation.
    assert_eq!(slow_outcome.unwrap_err().code, code::CANCELLED);
    assert_eq!(
        normal_outcome.unwrap().get("message").unwrap(),
        Value::String("echo: quick".into())
    );
    assert_eq!(aborted.signal().listener_count(), 0);
    assert_eq!(untouched.signal().listener_count(), 0);
}

#[test]
fn shared_signal_leaves_no_listener_residue() {
    let harness = echo_module();
    let module = harness.module.clone();
    let controller = AbortController::new();
    let signal = controller.signal();
    module
        .run({
            let module = module.clone();
            let signal = signal.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                for i in 0..5 {
                    let reply = client
                        .unary(
                            "unaryEcho",
                            request_with_message(&module, &format!("n{i}")),
                            CallOptions::default().with_signal(signal.clone()),
                        )
                        .unwrap()
                        .await
                        .unwrap();
                    assert_eq!(
                        reply.get("message").unwrap(),
                        Value::String(format!("echo: n{i}"))
                    );
                }
            }
        })
        .unwrap();
    assert_eq!(signal.listener_count(), 0);
}

#[test]
fn header_and_trailer_callbacks_fire_exactly_once() {
    let harness = echo_module();
    let module = harness.module.clone();
    let headers = Arc::new(Mutex::new(Vec::<Metadata>::new()));
    let trailers = Arc::new(Mutex::new(Vec::<Metadata>::new()));
    module
        .run({
            let module = module.clone();
            let headers = headers.clone();
            let trailers = trailers.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let mut metadata = Metadata::new();
                metadata.set("X-Echo-Header", ["traced"]).unwrap();
                let options = CallOptions::default()
                    .with_metadata(metadata)
                    .with_on_header({
                        let headers = headers.clone();
                        move |md| headers.lock().unwrap().push(md)
                    })
                    .with_on_trailer({
                        let trailers = trailers.clone();
                        move |md| trailers.lock().unwrap().push(md)
                    });
                client
                    .unary("unaryEcho", request_with_message(&module, "hi"), options)
                    .unwrap()
                    .await
                    .unwrap();
            }
        })
        .unwrap();
    let headers = headers.lock().unwrap();
    let trailers = trailers.lock().unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(trailers.len(), 1);
    assert_eq!(headers[0].get("x-echo-header"), Some("traced"));
    assert_eq!(trailers[0].get("x-handled-by"), Some("echo"));
}

#[test]
fn trailer_callback_fires_once_even_on_failure() {
    // Descriptors declare the service but no server was started, so the
    // channel itself answers UNIMPLEMENTED.
    let module = module(echo_service::descriptor_pool()).unwrap();
    let trailer_count = Arc::new(Mutex::new(0usize));
    let error = module
        .run({
            let module = module.clone();
            let trailer_count = trailer_count.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let options = CallOptions::default().with_on_trailer({
                    let trailer_count = trailer_count.clone();
                    move |_| *trailer_count.lock().unwrap() += 1
                });
                client
                    .unary(
                        "unaryEcho",
                        module.message(echo_service::REQUEST_TYPE).unwrap(),
                        options,
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::UNIMPLEMENTED);
    assert_eq!(*trailer_count.lock().unwrap(), 1);
}

#[test]
fn grpc_error_code_passes_through_and_details_round_trip() {
    let module = module(echo_service::descriptor_pool()).unwrap();
    let pool = module.descriptor_pool().clone();
    let handlers = stub_handlers(pool.clone()).unary("unaryEcho", move |_request, _call| {
        let pool = pool.clone();
        async move {
            let mut detail = new_message(&pool, echo_service::ERROR_DETAIL_TYPE)?;
            detail
                .set("reason", Value::String("quota".into()))
                .map_err(echo_service_impl::internal)?;
            Err(GrpcError::with_details(
                code::PERMISSION_DENIED,
                "denied",
                vec![detail],
            ))
        }
    });
    let mut server = module.create_server();
    server
        .add_service(echo_service::SERVICE_NAME, handlers)
        .unwrap();
    server.start().unwrap();

    let error = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                client
                    .unary(
                        "unaryEcho",
                        module.message(echo_service::REQUEST_TYPE).unwrap(),
                        CallOptions::default(),
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::PERMISSION_DENIED);
    assert_eq!(error.message, "denied");
    assert_eq!(error.details.len(), 1);
    assert_eq!(
        error.details[0].get("reason").unwrap(),
        Value::String("quota".into())
    );
}

#[test]
fn wrong_typed_handler_response_maps_to_internal() {
    let module = module(echo_service::descriptor_pool()).unwrap();
    let pool = module.descriptor_pool().clone();
    let handlers = stub_handlers(pool.clone()).unary("unaryEcho", move |_request, _call| {
        let pool = pool.clone();
        async move { new_message(&pool, echo_service::ITEM_TYPE) }
    });
    let mut server = module.create_server();
    server
        .add_service(echo_service::SERVICE_NAME, handlers)
        .unwrap();
    server.start().unwrap();

    let error = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                client
                    .unary(
                        "unaryEcho",
                        module.message(echo_service::REQUEST_TYPE).unwrap(),
                        CallOptions::default(),
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::INTERNAL);
}

#[test]
fn calls_against_an_unregistered_service_are_unimplemented() {
    // Descriptors declare the service, but no server was started.
    let module = module(echo_service::descriptor_pool()).unwrap();
    let error = module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                client
                    .unary(
                        "unaryEcho",
                        module.message(echo_service::REQUEST_TYPE).unwrap(),
                        CallOptions::default(),
                    )
                    .unwrap()
                    .await
                    .unwrap_err()
            }
        })
        .unwrap();
    assert_eq!(error.code, code::UNIMPLEMENTED);
}

#[test]
fn configuration_misuse_fails_synchronously() {
    let harness = echo_module();
    let module = harness.module.clone();

    // Unknown service.
    assert!(module.create_client("echo.Ghost", ClientOptions::default()).is_err());
    // A message symbol is not a service.
    assert!(
        module
            .create_client(echo_service::REQUEST_TYPE, ClientOptions::default())
            .is_err()
    );

    // The echo service is already live on the channel; a second server for
    // the same name is rejected when it starts.
    let mut server = module.create_server();
    server
        .add_service(
            echo_service::SERVICE_NAME,
            stub_handlers(module.descriptor_pool().clone()),
        )
        .unwrap();
    assert!(server.start().is_err());
}

#[test]
fn double_start_is_rejected() {
    let module = module(echo_service::descriptor_pool()).unwrap();
    let mut server = module.create_server();
    server
        .add_service(
            echo_service::SERVICE_NAME,
            stub_handlers(module.descriptor_pool().clone()),
        )
        .unwrap();
    server.start().unwrap();
    let error = server.start().unwrap_err();
    assert_eq!(error.to_string(), "already started");
}

#[test]
fn missing_handler_is_rejected_at_add_service() {
    let module = module(echo_service::descriptor_pool()).unwrap();
    let pool = module.descriptor_pool().clone();
    let incomplete = ServiceHandlers::new().unary("unaryEcho", move |_request, _call| {
        let pool = pool.clone();
        async move { new_message(&pool, echo_service::RESPONSE_TYPE) }
    });
    let mut server = module.create_server();
    let error = server
        .add_service(echo_service::SERVICE_NAME, incomplete)
        .unwrap_err();
    assert!(error.to_string().contains("missing handler"));
}

#[test]
fn wrong_flavor_invocation_is_a_synchronous_error() {
    let harness = echo_module();
    let module = harness.module.clone();
    module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let request = module.message(echo_service::REQUEST_TYPE).unwrap();
                assert!(
                    client
                        .unary("serverStreamingEcho", request, CallOptions::default())
                        .is_err()
                );
            }
        })
        .unwrap();
}

#[test]
fn wrong_typed_request_is_a_synchronous_error() {
    let harness = echo_module();
    let module = harness.module.clone();
    module
        .run({
            let module = module.clone();
            move || async move {
                let client = module
                    .create_client(echo_service::SERVICE_NAME, ClientOptions::default())
                    .unwrap();
                let not_a_request = module.message(echo_service::ITEM_TYPE).unwrap();
                assert!(
                    client
                        .unary("unaryEcho", not_a_request, CallOptions::default())
                        .is_err()
                );
            }
        })
        .unwrap();
}
