//! # Interceptor chain
//!
//! Client-side middleware composed as an onion around the terminal RPC
//! starter. Each interceptor receives the request and the next function; it
//! may mutate the header, inspect the method, await and transform the
//! response, or catch errors. The first configured entry is outermost, and a
//! zero-length chain is the identity.
//!
//! The chain is assembled lazily at call time; interceptor closures cross to
//! the loop once and their futures never leave it.
use crate::message::MessageValue;
use crate::metadata::Metadata;
use crate::status::GrpcError;
use futures_util::future::LocalBoxFuture;
use std::rc::Rc;
use std::sync::Arc;

/// The request an interceptor sees: the wire path, the outgoing header
/// metadata, and the request message (absent for client-initiated streams).
pub struct UnaryRequest {
    pub method: String,
    pub header: Metadata,
    pub message: Option<MessageValue>,
}

/// The continuation handed to each interceptor.
pub type Next = Rc<dyn Fn(UnaryRequest) -> LocalBoxFuture<'static, Result<MessageValue, GrpcError>>>;

/// A client interceptor.
pub type Interceptor = Arc<
    dyn Fn(UnaryRequest, Next) -> LocalBoxFuture<'static, Result<MessageValue, GrpcError>>
        + Send
        + Sync,
>;

/// Composes right-to-left over the terminal function, so the first entry of
/// the list wraps all the others.
pub(crate) fn compose(interceptors: &[Interceptor], terminal: Next) -> Next {
    let mut next = terminal;
    for interceptor in interceptors.iter().rev() {
        let interceptor = interceptor.clone();
        let inner = next;
        next = Rc::new(move |request| interceptor(request, inner.clone()));
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Mutex;

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

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let terminal: Next = Rc::new(|request| {
            async move { Err(GrpcError::internal(request.method)) }.boxed_local()
        });
        let chain = compose(&[], terminal);
        let err = chain(UnaryRequest {
            method: "/svc/M".into(),
            header: Metadata::new(),
            message: None,
        })
        .await
        .unwrap_err();
        assert_eq!(err.message, "/svc/M");
    }

    #[tokio::test]
    async fn first_entry_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let interceptors = vec![
            tracing_interceptor("first", trace.clone()),
            tracing_interceptor("second", trace.clone()),
        ];
        let inner_trace = trace.clone();
        let terminal: Next = Rc::new(move |_request| {
            let trace = inner_trace.clone();
            async move {
                trace.lock().unwrap().push("rpc".into());
                Err(GrpcError::internal("done"))
            }
            .boxed_local()
        });
        let chain = compose(&interceptors, terminal);
        let _ = chain(UnaryRequest {
            method: "/svc/M".into(),
            header: Metadata::new(),
            message: None,
        })
        .await;
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["first-before", "second-before", "rpc", "second-after", "first-after"]
        );
    }
}
