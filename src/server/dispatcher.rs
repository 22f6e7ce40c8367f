//! Command dispatcher: routes inbound frames to handlers by payload kind.
//!
//! The dispatcher is built once, before the acceptor starts, and is
//! read-only afterwards. Lookup misses and handler failures never reach
//! the reader task:
//! - no request handler: the request gets an "unsupported" response
//! - no stream handler: the create is refused with `TypeUnknown`
//! - handler error or panic: "unsupported" response, or `Unsupported`
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = CommandDispatcher::new()
//!     .handle(KIND_ECHO, |payload: Payload, _ctx| async move { Ok(payload) })
//!     .handle_typed(KIND_SPAN_COUNT, |spans: Vec<Span>, ctx| async move {
//!         ctx.reply(&spans.len())
//!     })
//!     .handle_stream(KIND_TAIL, |_payload, stream: StreamContext| async move {
//!         stream.set_listener(NoopListener);
//!         Ok(())
//!     });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;

use super::RequestContext;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::protocol::{CreateFailCode, Payload};
use crate::stream::StreamContext;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles requests of one payload kind.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response payload.
    fn call(&self, payload: Payload, ctx: RequestContext) -> BoxFuture<'static, Result<Payload>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Payload, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RequestContext) -> BoxFuture<'static, Result<Payload>> {
        Box::pin(self(payload, ctx))
    }
}

/// Wrapper that decodes the payload with MsgPack before calling the
/// handler and encodes its result with the request's kind.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> RequestHandler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RequestContext) -> BoxFuture<'static, Result<Payload>> {
        let parsed: T = match payload.decode() {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let kind = ctx.kind();
        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await?;
            Payload::encode(kind, &value)
        })
    }
}

/// Accept policy for streams of one payload kind.
///
/// Returning `Ok` accepts the stream; install a listener on the context
/// first to receive its data.
pub trait StreamHandler: Send + Sync + 'static {
    /// Decide on a stream the peer opened.
    fn open(&self, payload: Payload, stream: StreamContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(Payload, StreamContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn open(&self, payload: Payload, stream: StreamContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(payload, stream))
    }
}

/// Handles fire-and-forget messages of one payload kind.
pub trait MessageHandler: Send + Sync + 'static {
    /// Consume the message.
    fn call(&self, payload: Payload, ctx: RequestContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Payload, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RequestContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(payload, ctx))
    }
}

/// Registry mapping payload kinds to handlers.
#[derive(Default)]
pub struct CommandDispatcher {
    requests: HashMap<u16, Arc<dyn RequestHandler>>,
    streams: HashMap<u16, Arc<dyn StreamHandler>>,
    messages: HashMap<u16, Arc<dyn MessageHandler>>,
}

impl CommandDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler, replacing any previous one for `kind`.
    pub fn register_request_handler(&mut self, kind: u16, handler: impl RequestHandler) {
        if self.requests.insert(kind, Arc::new(handler)).is_some() {
            tracing::warn!("replacing request handler for kind {}", kind);
        }
    }

    /// Register a stream handler, replacing any previous one for `kind`.
    pub fn register_stream_handler(&mut self, kind: u16, handler: impl StreamHandler) {
        if self.streams.insert(kind, Arc::new(handler)).is_some() {
            tracing::warn!("replacing stream handler for kind {}", kind);
        }
    }

    /// Register a message handler, replacing any previous one for `kind`.
    pub fn register_message_handler(&mut self, kind: u16, handler: impl MessageHandler) {
        if self.messages.insert(kind, Arc::new(handler)).is_some() {
            tracing::warn!("replacing message handler for kind {}", kind);
        }
    }

    /// Register a request handler, builder style.
    pub fn handle<F, Fut>(mut self, kind: u16, handler: F) -> Self
    where
        F: Fn(Payload, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register_request_handler(kind, handler);
        self
    }

    /// Register a request handler over MsgPack-decoded values.
    pub fn handle_typed<F, T, R, Fut>(mut self, kind: u16, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register_request_handler(kind, TypedHandler::new(handler));
        self
    }

    /// Register a stream handler, builder style.
    pub fn handle_stream<F, Fut>(mut self, kind: u16, handler: F) -> Self
    where
        F: Fn(Payload, StreamContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_stream_handler(kind, handler);
        self
    }

    /// Register a message handler, builder style.
    pub fn on_message<F, Fut>(mut self, kind: u16, handler: F) -> Self
    where
        F: Fn(Payload, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_message_handler(kind, handler);
        self
    }

    /// Whether a request handler exists for `kind`.
    pub fn has_request_handler(&self, kind: u16) -> bool {
        self.requests.contains_key(&kind)
    }

    /// Whether a stream handler exists for `kind`.
    pub fn has_stream_handler(&self, kind: u16) -> bool {
        self.streams.contains_key(&kind)
    }

    /// Run the request handler on its own task and send the response.
    pub(crate) fn dispatch_request(
        &self,
        conn: Connection,
        request_id: u32,
        payload: Payload,
        permit: OwnedSemaphorePermit,
    ) {
        let kind = payload.kind();
        let handler = self.requests.get(&kind).cloned();

        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;

            let response = match handler {
                None => {
                    tracing::debug!("no request handler for kind {}", kind);
                    Payload::unsupported(&format!("no handler for kind {}", kind))
                }
                Some(handler) => {
                    let ctx = RequestContext::new(conn.clone(), request_id, kind);
                    match tokio::spawn(async move { handler.call(payload, ctx).await }).await {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => {
                            tracing::warn!("handler error for kind {}: {}", kind, e);
                            Payload::unsupported(&e.to_string())
                        }
                        Err(e) => {
                            tracing::error!("handler for kind {} failed: {}", kind, e);
                            Payload::unsupported("handler failed")
                        }
                    }
                }
            };

            match conn.respond(request_id, response).await {
                Ok(()) => {}
                Err(e @ TransportError::PayloadTooLarge { .. }) => {
                    tracing::warn!("response to request {} dropped: {}", request_id, e);
                    if let Err(e) = conn
                        .respond(request_id, Payload::unsupported(&e.to_string()))
                        .await
                    {
                        tracing::debug!("could not answer request {}: {}", request_id, e);
                    }
                }
                Err(e) => {
                    tracing::debug!("could not answer request {}: {}", request_id, e);
                }
            }
        });
    }

    /// Run the stream handler on its own task and accept or refuse.
    pub(crate) fn dispatch_stream(&self, stream: StreamContext, payload: Payload) {
        let kind = payload.kind();
        let Some(handler) = self.streams.get(&kind).cloned() else {
            tracing::debug!("no stream handler for kind {}", kind);
            stream.reject(CreateFailCode::TypeUnknown);
            return;
        };

        tokio::spawn(async move {
            let ctx = stream.clone();
            match tokio::spawn(async move { handler.open(payload, ctx).await }).await {
                Ok(Ok(())) => {
                    if let Err(e) = stream.accept().await {
                        tracing::debug!("stream {} not accepted: {}", stream.id(), e);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("stream handler error for kind {}: {}", kind, e);
                    stream.reject(CreateFailCode::Unsupported);
                }
                Err(e) => {
                    tracing::error!("stream handler for kind {} failed: {}", kind, e);
                    stream.reject(CreateFailCode::Unsupported);
                }
            }
        });
    }

    /// Run the message handler on its own task.
    pub(crate) fn dispatch_message(
        &self,
        conn: Connection,
        payload: Payload,
        permit: OwnedSemaphorePermit,
    ) {
        let kind = payload.kind();
        let Some(handler) = self.messages.get(&kind).cloned() else {
            tracing::debug!("no message handler for kind {}, dropping", kind);
            return;
        };

        tokio::spawn(async move {
            let _permit = permit;
            let ctx = RequestContext::new(conn, 0, kind);
            match tokio::spawn(async move { handler.call(payload, ctx).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("message handler error for kind {}: {}", kind, e),
                Err(e) => tracing::error!("message handler for kind {} failed: {}", kind, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let dispatcher = CommandDispatcher::new()
            .handle(1, |payload: Payload, _ctx| async move { Ok(payload) })
            .handle_typed(2, |n: u32, _ctx| async move { Ok(n + 1) })
            .handle_stream(3, |_payload, _stream| async { Ok(()) })
            .on_message(4, |_payload, _ctx| async { Ok(()) });

        assert!(dispatcher.has_request_handler(1));
        assert!(dispatcher.has_request_handler(2));
        assert!(dispatcher.has_stream_handler(3));
        assert!(!dispatcher.has_request_handler(3));
        assert!(dispatcher.messages.contains_key(&4));
    }

    struct Echo;

    impl RequestHandler for Echo {
        fn call(&self, payload: Payload, _ctx: RequestContext) -> BoxFuture<'static, Result<Payload>> {
            Box::pin(async move { Ok(payload) })
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register_request_handler(1, Echo);
        dispatcher.register_request_handler(1, Echo);
        dispatcher.register_request_handler(2, TypedHandler::new(|s: String, _ctx| async move {
            Ok(s.len())
        }));
        assert_eq!(dispatcher.requests.len(), 2);
    }
}
