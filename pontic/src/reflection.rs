//! # Reflection surface
//!
//! Server side: [`enable`ing reflection](crate::module::GrpcModule::enable_reflection)
//! registers the standard `grpc.reflection.v1` service on the in-process
//! channel, backed by the module's descriptor pool plus the reflection
//! protocol's own descriptors (so the service lists itself).
//!
//! Client side: [`ReflectionClient`] runs the wire exchanges on
//! channel-runtime tasks and settles promises on the loop, so discovery
//! never blocks script code.
pub mod client;

pub use client::ReflectionClient;

use crate::channel::RouteService;
use prost_reflect::DescriptorPool;
use tower::util::BoxCloneSyncService;

pub(crate) const REFLECTION_SERVICE: &str = "grpc.reflection.v1.ServerReflection";

#[derive(Debug, thiserror::Error)]
pub enum ReflectionSetupError {
    #[error("failed to build the reflection service: {0}")]
    Build(#[from] tonic_reflection::server::Error),
    #[error(transparent)]
    AlreadyRegistered(#[from] crate::channel::AlreadyRegistered),
}

/// Builds the v1 reflection route over the pool's descriptors.
pub(crate) fn reflection_route(pool: &DescriptorPool) -> Result<RouteService, ReflectionSetupError> {
    let descriptors = prost_types::FileDescriptorSet {
        file: pool
            .files()
            .map(|f| f.file_descriptor_proto().clone())
            .collect(),
    };
    let service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_reflection::pb::v1::FILE_DESCRIPTOR_SET)
        .register_file_descriptor_set(descriptors)
        .build_v1()?;
    Ok(BoxCloneSyncService::new(service))
}

/// A service description as discovered over the wire.
#[derive(Debug, Clone)]
pub struct ServiceDesc {
    pub full_name: String,
    pub name: String,
    pub methods: Vec<MethodDesc>,
}

#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: String,
    /// The script-side property name (first character lowercased).
    pub script_name: String,
    pub input_type: String,
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// A message type description as discovered over the wire.
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub full_name: String,
    pub fields: Vec<FieldDesc>,
    pub oneofs: Vec<OneofDesc>,
}

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub number: u32,
    pub kind: String,
    pub repeated: bool,
    pub map: bool,
    /// Full name of the submessage type, for message-kind fields.
    pub message_type: Option<String>,
    /// Full name of the enum type, for enum-kind fields.
    pub enum_type: Option<String>,
    pub default_value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OneofDesc {
    pub name: String,
    pub fields: Vec<String>,
}
