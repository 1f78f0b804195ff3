//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide protobuf
//! descriptors for integration testing the `pontic` binding. The
//! descriptors are built programmatically so the test suite needs no protoc
//! step. It is not intended for production use.
use prost_reflect::DescriptorPool;
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
    field_descriptor_proto::{Label, Type},
};

pub const SERVICE_NAME: &str = "echo.EchoService";
pub const REQUEST_TYPE: &str = "echo.EchoRequest";
pub const RESPONSE_TYPE: &str = "echo.EchoResponse";
pub const ITEM_TYPE: &str = "echo.Item";
pub const ERROR_DETAIL_TYPE: &str = "echo.ErrorDetail";

/// The `echo.proto` file the tests run against:
///
/// ```proto
/// syntax = "proto3";
/// package echo;
///
/// message EchoRequest { string message = 1; }
/// message EchoResponse { string message = 1; int32 code = 2; }
/// message Item { string id = 1; string name = 2; }
/// message ErrorDetail { string reason = 1; }
///
/// service EchoService {
///   rpc UnaryEcho(EchoRequest) returns (EchoResponse);
///   rpc ServerStreamingEcho(EchoRequest) returns (stream Item);
///   rpc ClientStreamingEcho(stream Item) returns (EchoResponse);
///   rpc BidirectionalEcho(stream EchoRequest) returns (stream EchoResponse);
/// }
/// ```
pub fn file_descriptor_set() -> FileDescriptorSet {
    FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("echo.proto".into()),
            package: Some("echo".into()),
            syntax: Some("proto3".into()),
            message_type: vec![
                message("EchoRequest", vec![string_field("message", 1)]),
                message(
                    "EchoResponse",
                    vec![string_field("message", 1), int32_field("code", 2)],
                ),
                message("Item", vec![string_field("id", 1), string_field("name", 2)]),
                message("ErrorDetail", vec![string_field("reason", 1)]),
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("EchoService".into()),
                method: vec![
                    method(
                        "UnaryEcho",
                        ".echo.EchoRequest",
                        ".echo.EchoResponse",
                        false,
                        false,
                    ),
                    method(
                        "ServerStreamingEcho",
                        ".echo.EchoRequest",
                        ".echo.Item",
                        false,
                        true,
                    ),
                    method(
                        "ClientStreamingEcho",
                        ".echo.Item",
                        ".echo.EchoResponse",
                        true,
                        false,
                    ),
                    method(
                        "BidirectionalEcho",
                        ".echo.EchoRequest",
                        ".echo.EchoResponse",
                        true,
                        true,
                    ),
                ],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// A pool holding the echo service descriptors.
pub fn descriptor_pool() -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(file_descriptor_set())
        .expect("echo descriptors are valid")
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.into()),
        field: fields,
        ..Default::default()
    }
}

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    scalar_field(name, number, Type::String)
}

fn int32_field(name: &str, number: i32) -> FieldDescriptorProto {
    scalar_field(name, number, Type::Int32)
}

fn scalar_field(name: &str, number: i32, r#type: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.into()),
        json_name: Some(name.into()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(r#type as i32),
        ..Default::default()
    }
}

fn method(
    name: &str,
    input_type: &str,
    output_type: &str,
    client_streaming: bool,
    server_streaming: bool,
) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.into()),
        input_type: Some(input_type.into()),
        output_type: Some(output_type.into()),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_declares_the_service_and_types() {
        let pool = descriptor_pool();
        let service = pool.get_service_by_name(SERVICE_NAME).unwrap();
        assert_eq!(service.methods().count(), 4);
        assert!(pool.get_message_by_name(REQUEST_TYPE).is_some());
        assert!(pool.get_message_by_name(RESPONSE_TYPE).is_some());
        assert!(pool.get_message_by_name(ITEM_TYPE).is_some());
        assert!(pool.get_message_by_name(ERROR_DETAIL_TYPE).is_some());
    }

    #[test]
    fn streaming_bits_match_the_declarations() {
        let pool = descriptor_pool();
        let service = pool.get_service_by_name(SERVICE_NAME).unwrap();
        let bits: Vec<(String, bool, bool)> = service
            .methods()
            .map(|m| {
                (
                    m.name().to_string(),
                    m.is_client_streaming(),
                    m.is_server_streaming(),
                )
            })
            .collect();
        assert_eq!(
            bits,
            vec![
                ("UnaryEcho".into(), false, false),
                ("ServerStreamingEcho".into(), false, true),
                ("ClientStreamingEcho".into(), true, false),
                ("BidirectionalEcho".into(), true, true),
            ]
        );
    }
}
