//! # Status & error model
//!
//! gRPC terminates every RPC with a status: a numeric code, a human-readable
//! message and an optional list of typed detail messages. This module reifies
//! that triple as [`GrpcError`] and maps it to and from [`tonic::Status`] at
//! the channel boundary.
//!
//! Detail messages travel in the status details bytes using the
//! `google.rpc.Status` wire shape, each entry packed as a
//! `google.protobuf.Any`.
use crate::message::MessageValue;
use prost::Message;
use prost_reflect::DescriptorPool;

/// The standard gRPC status codes.
pub mod code {
    pub const OK: i32 = 0;
    pub const CANCELLED: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const ALREADY_EXISTS: i32 = 6;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const RESOURCE_EXHAUSTED: i32 = 8;
    pub const FAILED_PRECONDITION: i32 = 9;
    pub const ABORTED: i32 = 10;
    pub const OUT_OF_RANGE: i32 = 11;
    pub const UNIMPLEMENTED: i32 = 12;
    pub const INTERNAL: i32 = 13;
    pub const UNAVAILABLE: i32 = 14;
    pub const DATA_LOSS: i32 = 15;
    pub const UNAUTHENTICATED: i32 = 16;
}

/// The reified status error crossing the script boundary.
///
/// Always carries `name() == "GrpcError"` so script code can distinguish a
/// typed status from an arbitrary failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("GrpcError {code}: {message}")]
pub struct GrpcError {
    pub code: i32,
    pub message: String,
    pub details: Vec<MessageValue>,
}

impl GrpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(
        code: i32,
        message: impl Into<String>,
        details: Vec<MessageValue>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }

    pub fn name(&self) -> &'static str {
        "GrpcError"
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL, message)
    }

    pub fn cancelled() -> Self {
        Self::new(code::CANCELLED, "the RPC was cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(code::DEADLINE_EXCEEDED, "the RPC deadline elapsed")
    }

    /// Maps an arbitrary failure to INTERNAL, deriving a message from the
    /// value the way a dynamic runtime would: its own message when it is an
    /// error, its rendering otherwise, `"unknown error"` when there is
    /// nothing to render.
    pub fn from_failure(failure: Option<&dyn std::fmt::Display>) -> Self {
        match failure {
            Some(value) => {
                let rendered = value.to_string();
                if rendered.is_empty() {
                    Self::internal("unknown error")
                } else {
                    Self::internal(rendered)
                }
            }
            None => Self::internal("unknown error"),
        }
    }

    /// Ingress mapping: a native status becomes a script error preserving
    /// code and message, with detail messages wrapped through the message
    /// adapter. Details whose type is absent from the pool are skipped.
    pub fn from_status(status: &tonic::Status, pool: &DescriptorPool) -> Self {
        let mut details = Vec::new();
        if !status.details().is_empty()
            && let Ok(proto) = RpcStatus::decode(status.details())
        {
            for any in proto.details {
                let type_name = any.type_url.rsplit('/').next().unwrap_or_default();
                let Some(desc) = pool.get_message_by_name(type_name) else {
                    log::debug!("skipping status detail of unknown type '{type_name}'");
                    continue;
                };
                if let Ok(value) = MessageValue::decode(desc, any.value.as_slice()) {
                    details.push(value);
                }
            }
        }
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
            details,
        }
    }

    /// Egress mapping: the error becomes a native status of matching code,
    /// message and details.
    pub fn into_status(self) -> tonic::Status {
        self.into_status_with_trailers(crate::metadata::Metadata::new())
    }

    /// Egress mapping carrying trailer metadata alongside the status.
    pub fn into_status_with_trailers(
        self,
        trailers: crate::metadata::Metadata,
    ) -> tonic::Status {
        let code = tonic::Code::from_i32(self.code);
        let metadata = trailers.to_tonic().unwrap_or_default();
        if self.details.is_empty() {
            return tonic::Status::with_metadata(code, self.message, metadata);
        }
        let proto = RpcStatus {
            code: self.code,
            message: self.message.clone(),
            details: self
                .details
                .iter()
                .map(|detail| prost_types::Any {
                    type_url: format!("type.googleapis.com/{}", detail.full_name()),
                    value: detail.encode_to_vec(),
                })
                .collect(),
        };
        tonic::Status::with_details_and_metadata(
            code,
            self.message,
            bytes::Bytes::from(proto.encode_to_vec()),
            metadata,
        )
    }
}

/// Mirror of `google.rpc.Status`, the wire shape gRPC uses to carry rich
/// error details in trailers.
#[derive(Clone, PartialEq, ::prost::Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    details: ::prost::alloc::vec::Vec<::prost_types::Any>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_constants_cover_the_standard_set() {
        assert_eq!(code::OK, 0);
        assert_eq!(code::CANCELLED, 1);
        assert_eq!(code::UNIMPLEMENTED, 12);
        assert_eq!(code::INTERNAL, 13);
        assert_eq!(code::UNAUTHENTICATED, 16);
    }

    #[test]
    fn status_round_trip_preserves_code_and_message() {
        let pool = DescriptorPool::new();
        let err = GrpcError::new(code::PERMISSION_DENIED, "nope");
        let status = err.into_status();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        let back = GrpcError::from_status(&status, &pool);
        assert_eq!(back.code, code::PERMISSION_DENIED);
        assert_eq!(back.message, "nope");
        assert_eq!(back.name(), "GrpcError");
    }

    #[test]
    fn arbitrary_failures_map_to_internal() {
        let err = GrpcError::from_failure(Some(&"boom"));
        assert_eq!(err.code, code::INTERNAL);
        assert_eq!(err.message, "boom");

        let err = GrpcError::from_failure(None);
        assert_eq!(err.code, code::INTERNAL);
        assert_eq!(err.message, "unknown error");

        let err = GrpcError::from_failure(Some(&""));
        assert_eq!(err.message, "unknown error");
    }
}
