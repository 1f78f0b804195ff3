//! # Pontic
//!
//! `pontic` binds an in-process gRPC channel to a cooperative, single-threaded
//! script loop. Script code — closures executed on the loop — can author both
//! clients and servers for arbitrary gRPC services described by protobuf
//! descriptors, with all four RPC flavors, metadata, deadlines, cancellation,
//! interceptors, and typed status errors.
//!
//! ## The two worlds
//!
//! * **Channel world**: a multi-threaded tokio runtime owned by the module.
//!   Every RPC is driven by its own task there; frame send/recv and context
//!   cancellation block only those tasks.
//! * **Loop world**: one dedicated thread running a current-thread runtime
//!   plus a `LocalSet`. Handler invocations, promise settlements, interceptor
//!   execution and metadata callbacks all happen on this thread, and only
//!   this thread.
//!
//! The [`sched`] module is the single bridge between the two: work crosses
//! over exclusively through its submit queue, which also serializes promise
//! settlements so that per-RPC event ordering is preserved.
//!
//! ## Key components
//!
//! * **[`module::GrpcModule`]**: the entry point. Built from three
//!   collaborators (channel, descriptor pool, event loop), it exposes
//!   `create_client`, `create_server`, `create_reflection_client`,
//!   `enable_reflection` and the offline descriptor lookups.
//! * **[`message::MessageValue`] / [`metadata::Metadata`] /
//!   [`status::GrpcError`]**: the wrapper types crossing the boundary.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that
//! consumers use compatible versions of these underlying dependencies.
pub mod cancel;
pub mod channel;
pub mod client;
pub mod message;
pub mod metadata;
pub mod module;
pub mod reflection;
pub mod resolver;
pub mod sched;
pub mod server;
pub mod status;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;
