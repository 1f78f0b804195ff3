//! # Module wiring
//!
//! The single entry point binding the three collaborators together: the
//! in-process channel, the descriptor pool, and the event loop. Each is
//! supplied through a builder option; a missing collaborator fails
//! construction with its own named error.
//!
//! The built [`GrpcModule`] owns the channel runtime (the "goroutine" side)
//! and exposes the whole surface: `create_client`, `create_server`,
//! `create_reflection_client`, `enable_reflection`, the offline descriptor
//! lookups, and [`GrpcModule::run`] — the entry through which embedders and
//! tests execute script code on the loop.
use crate::channel::InProcessChannel;
use crate::client::{BindError, Client, ClientOptions};
use crate::message::MessageValue;
use crate::reflection::{self, ReflectionClient, ReflectionSetupError};
use crate::resolver::{ResolveError, Resolver};
use crate::sched::{EventLoop, LoopClosed, LoopHandle};
use crate::server::ServerBuilder;
use prost_reflect::DescriptorPool;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, Runtime};

#[derive(Debug, thiserror::Error)]
pub enum ModuleBuildError {
    #[error("missing in-process channel")]
    MissingChannel,
    #[error("missing descriptor pool")]
    MissingDescriptors,
    #[error("missing event loop")]
    MissingEventLoop,
    #[error("failed to start the channel runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Collects the module's collaborators.
#[derive(Default)]
pub struct ModuleBuilder {
    channel: Option<InProcessChannel>,
    descriptors: Option<DescriptorPool>,
    event_loop: Option<EventLoop>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel: InProcessChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn descriptors(mut self, pool: DescriptorPool) -> Self {
        self.descriptors = Some(pool);
        self
    }

    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    pub fn build(self) -> Result<GrpcModule, ModuleBuildError> {
        let channel = self.channel.ok_or(ModuleBuildError::MissingChannel)?;
        let descriptors = self.descriptors.ok_or(ModuleBuildError::MissingDescriptors)?;
        let event_loop = self.event_loop.ok_or(ModuleBuildError::MissingEventLoop)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("pontic-channel")
            .build()
            .map_err(ModuleBuildError::Runtime)?;
        let runtime_handle = runtime.handle().clone();
        Ok(GrpcModule {
            inner: Arc::new(ModuleInner {
                channel,
                resolver: Resolver::new(descriptors),
                event_loop,
                runtime: Mutex::new(Some(runtime)),
                runtime_handle,
            }),
        })
    }
}

/// Builds a module with a fresh channel and loop around the given
/// descriptors. The builder form exists for embedders that share a channel
/// or a loop across bindings.
pub fn module(descriptors: DescriptorPool) -> Result<GrpcModule, ModuleBuildError> {
    ModuleBuilder::new()
        .channel(InProcessChannel::new())
        .descriptors(descriptors)
        .event_loop(EventLoop::new())
        .build()
}

/// The module surface. Cheap to clone; all clones share the same channel,
/// loop and runtime.
#[derive(Clone)]
pub struct GrpcModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    channel: InProcessChannel,
    resolver: Resolver,
    event_loop: EventLoop,
    runtime: Mutex<Option<Runtime>>,
    runtime_handle: Handle,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().expect("runtime lock").take() {
            runtime.shutdown_background();
        }
    }
}

impl GrpcModule {
    /// Builds a client for a service declared in the descriptor pool.
    pub fn create_client(
        &self,
        service: &str,
        options: ClientOptions,
    ) -> Result<Client, BindError> {
        let descriptor = self.inner.resolver.service(service)?;
        Ok(Client::new(
            descriptor,
            self.inner.resolver.clone(),
            self.inner.channel.clone(),
            self.inner.runtime_handle.clone(),
            self.inner.event_loop.handle(),
            options,
        ))
    }

    /// Builds a server registration builder.
    pub fn create_server(&self) -> ServerBuilder {
        ServerBuilder::new(
            self.inner.resolver.clone(),
            self.inner.channel.clone(),
            self.inner.event_loop.handle(),
        )
    }

    /// Builds a reflection discovery client over the same channel.
    pub fn create_reflection_client(&self) -> ReflectionClient {
        ReflectionClient::new(
            self.inner.channel.clone(),
            self.inner.runtime_handle.clone(),
            self.inner.event_loop.handle(),
        )
    }

    /// Registers the standard v1 reflection service on the channel.
    pub fn enable_reflection(&self) -> Result<(), ReflectionSetupError> {
        let route = reflection::reflection_route(self.inner.resolver.pool())?;
        self.inner
            .channel
            .register(reflection::REFLECTION_SERVICE, route)?;
        Ok(())
    }

    /// Creates an empty message of a pool-declared type.
    pub fn message(&self, type_name: &str) -> Result<MessageValue, ResolveError> {
        Ok(MessageValue::new(
            self.inner.resolver.message_type(type_name)?,
        ))
    }

    /// Offline service listing straight from the pool.
    pub fn list_services(&self) -> Vec<String> {
        self.inner.resolver.list_services()
    }

    /// Offline type description straight from the pool, no wire exchange.
    pub fn describe_type(
        &self,
        type_name: &str,
    ) -> Result<crate::reflection::TypeDesc, ResolveError> {
        let descriptor = self.inner.resolver.message_type(type_name)?;
        Ok(crate::reflection::client::describe_message(&descriptor))
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        self.inner.resolver.pool()
    }

    pub fn channel(&self) -> InProcessChannel {
        self.inner.channel.clone()
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.event_loop.handle()
    }

    /// Runs a script closure on the loop, blocking the caller until its
    /// future settles.
    pub fn run<F, Fut, T>(&self, f: F) -> Result<T, LoopClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.inner.event_loop.run(f)
    }
}
