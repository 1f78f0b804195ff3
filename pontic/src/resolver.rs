//! # Service resolver
//!
//! Looks services and methods up in the module's descriptor pool. Methods are
//! addressable both by their canonical descriptor name (`UnaryEcho`) and by
//! the script-side convention of lowercasing the first character
//! (`unaryEcho`).
use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("service '{0}' not found")]
    ServiceNotFound(String),
    #[error("'{0}' is not a service")]
    NotAService(String),
    #[error("method '{method}' not found on service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("message type '{0}' not found")]
    TypeNotFound(String),
}

/// The four RPC shapes a method's streaming bits can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFlavor {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl RpcFlavor {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => Self::Unary,
            (false, true) => Self::ServerStreaming,
            (true, false) => Self::ClientStreaming,
            (true, true) => Self::BidiStreaming,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::BidiStreaming => "bidi-streaming",
        }
    }
}

/// The script-side name of a descriptor method: first character lowercased.
pub fn script_method_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Descriptor lookups over a pool.
#[derive(Clone)]
pub struct Resolver {
    pool: DescriptorPool,
}

impl Resolver {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Fully qualified service names known to the pool.
    pub fn list_services(&self) -> Vec<String> {
        self.pool
            .services()
            .map(|s| s.full_name().to_string())
            .collect()
    }

    /// Resolves a fully qualified service name, distinguishing a missing
    /// symbol from a symbol that is not a service.
    pub fn service(&self, full_name: &str) -> Result<ServiceDescriptor, ResolveError> {
        if let Some(service) = self.pool.get_service_by_name(full_name) {
            return Ok(service);
        }
        if self.pool.get_message_by_name(full_name).is_some()
            || self.pool.get_enum_by_name(full_name).is_some()
        {
            return Err(ResolveError::NotAService(full_name.to_string()));
        }
        Err(ResolveError::ServiceNotFound(full_name.to_string()))
    }

    /// Resolves a fully qualified message type name.
    pub fn message_type(
        &self,
        full_name: &str,
    ) -> Result<prost_reflect::MessageDescriptor, ResolveError> {
        self.pool
            .get_message_by_name(full_name)
            .ok_or_else(|| ResolveError::TypeNotFound(full_name.to_string()))
    }

    /// Finds a method by canonical or script-side name.
    pub fn method(
        &self,
        service: &ServiceDescriptor,
        name: &str,
    ) -> Result<MethodDescriptor, ResolveError> {
        service
            .methods()
            .find(|m| m.name() == name || script_method_name(m.name()) == name)
            .ok_or_else(|| ResolveError::MethodNotFound {
                service: service.full_name().to_string(),
                method: name.to_string(),
            })
    }
}
