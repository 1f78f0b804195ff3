//! # Reflection client
//!
//! Speaks `grpc.reflection.v1` over the in-process channel by posting
//! reflection requests as normal RPCs on a channel-runtime task.
//!
//! Descriptor resolution handles the import graph: the server returns a
//! `FileDescriptorProto` batch, the client inspects its imports and keeps
//! requesting missing files over the same bidi stream until the transitive
//! closure is complete. A server that returns the same file twice, or a
//! self-referential import, cannot make this loop forever: files already
//! collected and files already requested are both tracked.
use super::{FieldDesc, MethodDesc, OneofDesc, ServiceDesc, TypeDesc};
use crate::channel::InProcessChannel;
use crate::resolver::script_method_name;
use crate::sched::{LoopHandle, Promise};
use crate::status::{GrpcError, code};
use futures_util::stream::once;
use prost::Message;
use prost_reflect::{DescriptorError, DescriptorPool, Kind, MessageDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::{BTreeMap, HashSet};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic_reflection::pb::v1::{
    ServerReflectionRequest, server_reflection_client::ServerReflectionClient,
    server_reflection_request::MessageRequest, server_reflection_response::MessageResponse,
};

// The host field of reflection requests is not meaningful for an in-process
// exchange.
const EMPTY_HOST: &str = "";

#[derive(Debug, thiserror::Error)]
pub enum ReflectionResolveError {
    #[error(
        "failed to start a stream with the reflection server, reflection might not be enabled: '{0}'"
    )]
    ServerStreamInitFailed(#[source] tonic::Status),

    #[error("the reflection stream returned an error status: '{0}'")]
    ServerStreamFailure(#[source] tonic::Status),

    #[error("reflection stream closed unexpectedly")]
    StreamClosed,

    #[error("internal error: failed to send request to stream")]
    SendFailed,

    #[error("server returned reflection error code {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("protocol error: received unexpected response type: {0}")]
    UnexpectedResponseType(String),

    #[error("failed to decode FileDescriptorProto: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to build a descriptor pool: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("symbol '{0}' not found")]
    NotFound(String),

    #[error("'{0}' is not a message type")]
    NotAMessage(String),
}

impl ReflectionResolveError {
    fn into_grpc(self) -> GrpcError {
        match self {
            Self::ServerStreamInitFailed(status) | Self::ServerStreamFailure(status) => {
                GrpcError::new(status.code() as i32, status.message())
            }
            Self::ServerError { code, message } => GrpcError::new(code, message),
            Self::NotFound(symbol) => {
                GrpcError::new(code::NOT_FOUND, format!("symbol '{symbol}' not found"))
            }
            Self::NotAMessage(symbol) => GrpcError::new(
                code::INVALID_ARGUMENT,
                format!("'{symbol}' is not a message type"),
            ),
            other => GrpcError::internal(other.to_string()),
        }
    }
}

/// Discovery handle over the in-process channel. Every operation runs on a
/// channel task and settles its promise on the loop.
pub struct ReflectionClient {
    channel: InProcessChannel,
    runtime: Handle,
    sched: LoopHandle,
}

impl ReflectionClient {
    pub(crate) fn new(channel: InProcessChannel, runtime: Handle, sched: LoopHandle) -> Self {
        Self {
            channel,
            runtime,
            sched,
        }
    }

    /// Lists the fully qualified names of every service the server exposes.
    pub fn list_services(&self) -> Promise<Vec<String>> {
        let (resolver, promise) = self.sched.promise();
        let channel = self.channel.clone();
        self.runtime.spawn(async move {
            match list_services_wire(channel).await {
                Ok(services) => resolver.resolve(services),
                Err(error) => resolver.reject(error.into_grpc()),
            }
        });
        promise
    }

    /// Describes a service: its methods with their streaming bits and
    /// message types.
    pub fn describe_service(&self, full_name: &str) -> Promise<ServiceDesc> {
        let (resolver, promise) = self.sched.promise();
        let channel = self.channel.clone();
        let symbol = full_name.to_string();
        self.runtime.spawn(async move {
            match describe_service_wire(channel, &symbol).await {
                Ok(desc) => resolver.resolve(desc),
                Err(error) => resolver.reject(error.into_grpc()),
            }
        });
        promise
    }

    /// Describes a message type: fields, kinds, flags and oneof groups.
    pub fn describe_type(&self, full_name: &str) -> Promise<TypeDesc> {
        let (resolver, promise) = self.sched.promise();
        let channel = self.channel.clone();
        let symbol = full_name.to_string();
        self.runtime.spawn(async move {
            match describe_type_wire(channel, &symbol).await {
                Ok(desc) => resolver.resolve(desc),
                Err(error) => resolver.reject(error.into_grpc()),
            }
        });
        promise
    }
}

async fn list_services_wire(
    channel: InProcessChannel,
) -> Result<Vec<String>, ReflectionResolveError> {
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: EMPTY_HOST.to_string(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };

    let mut response_stream = client
        .server_reflection_info(once(async { request }))
        .await
        .map_err(ReflectionResolveError::ServerStreamInitFailed)?
        .into_inner();

    let response = response_stream
        .message()
        .await
        .map_err(ReflectionResolveError::ServerStreamFailure)?
        .ok_or(ReflectionResolveError::StreamClosed)?;

    match response.message_response {
        Some(MessageResponse::ListServicesResponse(resp)) => {
            Ok(resp.service.into_iter().map(|s| s.name).collect())
        }
        other => Err(unexpected(other)),
    }
}

async fn describe_service_wire(
    channel: InProcessChannel,
    symbol: &str,
) -> Result<ServiceDesc, ReflectionResolveError> {
    let pool = pool_for_symbol(channel, symbol).await?;
    let service = pool
        .get_service_by_name(symbol)
        .ok_or_else(|| ReflectionResolveError::NotFound(symbol.to_string()))?;
    Ok(ServiceDesc {
        full_name: service.full_name().to_string(),
        name: service.name().to_string(),
        methods: service
            .methods()
            .map(|method| MethodDesc {
                name: method.name().to_string(),
                script_name: script_method_name(method.name()),
                input_type: method.input().full_name().to_string(),
                output_type: method.output().full_name().to_string(),
                client_streaming: method.is_client_streaming(),
                server_streaming: method.is_server_streaming(),
            })
            .collect(),
    })
}

async fn describe_type_wire(
    channel: InProcessChannel,
    symbol: &str,
) -> Result<TypeDesc, ReflectionResolveError> {
    let pool = pool_for_symbol(channel, symbol).await?;
    let message = pool
        .get_message_by_name(symbol)
        .ok_or_else(|| match pool.get_service_by_name(symbol) {
            Some(_) => ReflectionResolveError::NotAMessage(symbol.to_string()),
            None if pool.get_enum_by_name(symbol).is_some() => {
                ReflectionResolveError::NotAMessage(symbol.to_string())
            }
            None => ReflectionResolveError::NotFound(symbol.to_string()),
        })?;
    Ok(describe_message(&message))
}

/// Builds a [`TypeDesc`] from an already-resolved descriptor. Also used for
/// offline lookups straight out of the module's pool.
pub(crate) fn describe_message(message: &MessageDescriptor) -> TypeDesc {
    TypeDesc {
        full_name: message.full_name().to_string(),
        fields: message
            .fields()
            .map(|field| {
                let kind = field.kind();
                FieldDesc {
                    name: field.name().to_string(),
                    number: field.number(),
                    kind: kind_name(&kind).to_string(),
                    repeated: field.is_list(),
                    map: field.is_map(),
                    message_type: match &kind {
                        Kind::Message(m) => Some(m.full_name().to_string()),
                        _ => None,
                    },
                    enum_type: match &kind {
                        Kind::Enum(e) => Some(e.full_name().to_string()),
                        _ => None,
                    },
                    default_value: default_value(&field),
                }
            })
            .collect(),
        oneofs: message
            .oneofs()
            .map(|oneof| OneofDesc {
                name: oneof.name().to_string(),
                fields: oneof.fields().map(|f| f.name().to_string()).collect(),
            })
            .collect(),
    }
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) => "message",
        Kind::Enum(_) => "enum",
    }
}

fn default_value(field: &prost_reflect::FieldDescriptor) -> serde_json::Value {
    use serde_json::{Value, json};
    if field.is_map() {
        return json!({});
    }
    if field.is_list() {
        return json!([]);
    }
    match field.kind() {
        Kind::Double | Kind::Float => json!(0.0),
        Kind::Int32
        | Kind::Int64
        | Kind::Uint32
        | Kind::Uint64
        | Kind::Sint32
        | Kind::Sint64
        | Kind::Fixed32
        | Kind::Fixed64
        | Kind::Sfixed32
        | Kind::Sfixed64 => json!(0),
        Kind::Bool => json!(false),
        Kind::String | Kind::Bytes => json!(""),
        Kind::Enum(e) => e
            .values()
            .find(|v| v.number() == 0)
            .or_else(|| e.values().next())
            .map(|v| json!(v.name()))
            .unwrap_or(Value::Null),
        Kind::Message(_) => Value::Null,
    }
}

/// Resolves the file containing the symbol plus its transitive dependency
/// closure into a fresh pool.
async fn pool_for_symbol(
    channel: InProcessChannel,
    symbol: &str,
) -> Result<DescriptorPool, ReflectionResolveError> {
    let fd_set = file_descriptor_set_by_symbol(channel, symbol).await?;
    Ok(DescriptorPool::from_file_descriptor_set(fd_set)?)
}

/// Asks the reflection service for the file containing the symbol, then
/// walks the import graph over the same stream: each answered file has its
/// unseen imports turned into `FileByFilename` requests, until nothing is
/// outstanding. Every response settles exactly one request, so a server
/// that repeats a file — or a file that imports itself — only shrinks the
/// outstanding count; the walk cannot loop.
async fn file_descriptor_set_by_symbol(
    channel: InProcessChannel,
    symbol: &str,
) -> Result<FileDescriptorSet, ReflectionResolveError> {
    let mut client = ServerReflectionClient::new(channel);
    let (requests, inbound) = mpsc::channel(100);

    let mut responses = client
        .server_reflection_info(ReceiverStream::new(inbound))
        .await
        .map_err(ReflectionResolveError::ServerStreamInitFailed)?
        .into_inner();

    send_request(
        &requests,
        MessageRequest::FileContainingSymbol(symbol.to_string()),
    )
    .await?;

    // Files keyed by name; `seen` also tracks names merely requested, so a
    // diamond import is fetched once.
    let mut files: BTreeMap<String, FileDescriptorProto> = BTreeMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut outstanding = 1usize;

    while outstanding > 0 {
        let response = responses
            .message()
            .await
            .map_err(ReflectionResolveError::ServerStreamFailure)?
            .ok_or(ReflectionResolveError::StreamClosed)?;
        outstanding -= 1;

        let batch = match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(batch)) => batch.file_descriptor_proto,
            Some(MessageResponse::ErrorResponse(error)) => {
                return Err(ReflectionResolveError::ServerError {
                    code: error.error_code,
                    message: error.error_message,
                });
            }
            other => return Err(unexpected(other)),
        };

        for raw in batch {
            let file = FileDescriptorProto::decode(raw.as_ref())?;
            let Some(name) = file.name.clone() else {
                continue;
            };
            if files.contains_key(&name) {
                // A duplicate answer settles a request without adding work.
                continue;
            }
            seen.insert(name.clone());
            for import in &file.dependency {
                if !files.contains_key(import) && seen.insert(import.clone()) {
                    send_request(&requests, MessageRequest::FileByFilename(import.clone()))
                        .await?;
                    outstanding += 1;
                }
            }
            files.insert(name, file);
        }
    }

    Ok(FileDescriptorSet {
        file: files.into_values().collect(),
    })
}

async fn send_request(
    requests: &mpsc::Sender<ServerReflectionRequest>,
    message: MessageRequest,
) -> Result<(), ReflectionResolveError> {
    requests
        .send(ServerReflectionRequest {
            host: EMPTY_HOST.to_string(),
            message_request: Some(message),
        })
        .await
        .map_err(|_| ReflectionResolveError::SendFailed)
}

fn unexpected(response: Option<MessageResponse>) -> ReflectionResolveError {
    match response {
        Some(other) => ReflectionResolveError::UnexpectedResponseType(format!("{other:?}")),
        None => ReflectionResolveError::UnexpectedResponseType("empty message".into()),
    }
}
