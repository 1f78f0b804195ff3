//! # In-process channel
//!
//! The channel is the transport shared by every client and server built
//! through the module. It is a clonable tower service that routes
//! `/package.Service/Method` paths to the route services registered for each
//! service, entirely inside the process: a client `tonic::client::Grpc`
//! drives it directly, so request frames never leave the address space.
//!
//! Unknown services and methods answer with the standard UNIMPLEMENTED
//! status frame.
pub mod codec;

use http::{HeaderName, HeaderValue};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tonic::body::Body;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

const GRPC_STATUS: HeaderName = HeaderName::from_static("grpc-status");
const GRPC_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/grpc");

/// A registered per-service route: any grpc-speaking tower service.
pub(crate) type RouteService =
    BoxCloneSyncService<http::Request<Body>, http::Response<Body>, Infallible>;

#[derive(Debug, thiserror::Error)]
#[error("service '{0}' is already registered on the channel")]
pub struct AlreadyRegistered(pub String);

/// The process-wide in-process gRPC transport.
#[derive(Clone, Default)]
pub struct InProcessChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    routes: RwLock<HashMap<String, RouteService>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a route service under a fully qualified service name.
    pub(crate) fn register(
        &self,
        service: &str,
        route: RouteService,
    ) -> Result<(), AlreadyRegistered> {
        let mut routes = self.inner.routes.write().expect("channel routes lock");
        if routes.contains_key(service) {
            return Err(AlreadyRegistered(service.to_string()));
        }
        log::debug!("registering service '{service}' on the in-process channel");
        routes.insert(service.to_string(), route);
        Ok(())
    }

    fn route_for(&self, path: &str) -> Option<RouteService> {
        // Paths have the shape "/package.Service/Method".
        let service = path.strip_prefix('/')?.split('/').next()?;
        self.inner
            .routes
            .read()
            .expect("channel routes lock")
            .get(service)
            .cloned()
    }
}

impl tower::Service<http::Request<Body>> for InProcessChannel {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = futures_util::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        match self.route_for(request.uri().path()) {
            Some(route) => Box::pin(route.oneshot(request)),
            None => {
                log::debug!("no route for '{}'", request.uri().path());
                Box::pin(std::future::ready(Ok(unimplemented_response())))
            }
        }
    }
}

/// The response for a path the channel does not know about: a trailers-only
/// frame carrying the UNIMPLEMENTED status.
pub(crate) fn unimplemented_response() -> http::Response<Body> {
    let mut response = http::Response::new(Body::default());
    let headers = response.headers_mut();
    headers.insert(GRPC_STATUS, HeaderValue::from(tonic::Code::Unimplemented as i32));
    headers.insert(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);
    response
}
