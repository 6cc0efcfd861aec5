//! Handler registry for dispatching calls by operation name.
//!
//! Two independent maps: future handlers and stream handlers. Registering a
//! name again replaces the earlier handler.
//!
//! Routing: a payload shaped like an operation invocation
//! (`{"function": <name>, "args": [...]}`) goes to the handler registered
//! under that name, which receives the `args` array. Any other payload goes
//! to the most recently registered handler of the matching kind.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use portwire::handler::{HandlerRegistry, TypedFutureHandler};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_future_arc("add", Arc::new(TypedFutureHandler::new(|(a, b): (i64, i64), _ctx| async move {
//!     Ok(a + b)
//! })));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::CallContext;
use crate::codec::JsonCodec;
use crate::error::{PortwireError, Result};
use crate::protocol::OperationInvoke;

/// Result type for handler functions.
pub type HandlerResult<T> = Result<T>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of values produced by a stream handler.
pub type ValueStream = BoxStream<'static, Result<Value>>;

/// A handler for future calls.
pub trait FutureHandler: Send + Sync + 'static {
    /// Handle a call with its raw payload.
    fn call(&self, payload: Value, ctx: CallContext) -> BoxFuture<'static, Result<Value>>;
}

/// A handler for stream calls.
pub trait StreamHandler: Send + Sync + 'static {
    /// Produce the stream for a call. An `Err` is an immediate stream error.
    fn call(&self, payload: Value, ctx: CallContext) -> Result<ValueStream>;
}

/// Wrapper that decodes the payload and encodes the result around a typed
/// async function.
pub struct TypedFutureHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedFutureHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> FutureHandler for TypedFutureHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: CallContext) -> BoxFuture<'static, Result<Value>> {
        let parsed: T = match JsonCodec::decode(payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await?;
            JsonCodec::encode(&value)
        })
    }
}

/// Wrapper that decodes the payload and encodes each item around a typed
/// stream-producing function.
pub struct TypedStreamHandler<F, T, R, S> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, S)>,
}

impl<F, T, R, S> TypedStreamHandler<F, T, R, S>
where
    F: Fn(T, CallContext) -> S + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    S: Stream<Item = HandlerResult<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, S> StreamHandler for TypedStreamHandler<F, T, R, S>
where
    F: Fn(T, CallContext) -> S + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    S: Stream<Item = HandlerResult<R>> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: CallContext) -> Result<ValueStream> {
        let parsed: T = JsonCodec::decode(payload)
            .map_err(|e| PortwireError::NotAStream(e.to_string()))?;

        let stream = (self.handler)(parsed, ctx)
            .map(|item| item.and_then(|value| JsonCodec::encode(&value)));
        Ok(stream.boxed())
    }
}

/// Registry mapping operation names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    future_handlers: HashMap<String, Arc<dyn FutureHandler>>,
    stream_handlers: HashMap<String, Arc<dyn StreamHandler>>,
    /// Most recently registered future handler, target of bare payloads.
    latest_future: Option<String>,
    /// Most recently registered stream handler, target of bare payloads.
    latest_stream: Option<String>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn register_future<H: FutureHandler>(&mut self, name: &str, handler: H) {
        self.register_future_arc(name, Arc::new(handler));
    }

    /// Register a future handler, replacing any prior one under `name`.
    pub fn register_future_arc(&mut self, name: &str, handler: Arc<dyn FutureHandler>) {
        self.future_handlers.insert(name.to_string(), handler);
        self.latest_future = Some(name.to_string());
    }

    #[cfg(test)]
    pub(crate) fn register_stream<H: StreamHandler>(&mut self, name: &str, handler: H) {
        self.register_stream_arc(name, Arc::new(handler));
    }

    /// Register a stream handler, replacing any prior one under `name`.
    pub fn register_stream_arc(&mut self, name: &str, handler: Arc<dyn StreamHandler>) {
        self.stream_handlers.insert(name.to_string(), handler);
        self.latest_stream = Some(name.to_string());
    }

    pub fn has_future_handlers(&self) -> bool {
        !self.future_handlers.is_empty()
    }

    pub fn has_stream_handlers(&self) -> bool {
        !self.stream_handlers.is_empty()
    }

    pub fn get_future(&self, name: &str) -> Option<Arc<dyn FutureHandler>> {
        self.future_handlers.get(name).cloned()
    }

    pub fn get_stream(&self, name: &str) -> Option<Arc<dyn StreamHandler>> {
        self.stream_handlers.get(name).cloned()
    }

    /// Registered future operation names, sorted.
    pub fn future_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.future_handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered stream operation names, sorted.
    pub fn stream_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stream_handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Pick the future handler for a payload.
    ///
    /// Returns the handler, the payload it should receive, and the operation
    /// name it was routed by.
    pub fn resolve_future(
        &self,
        payload: Value,
    ) -> Result<(Arc<dyn FutureHandler>, Value, Option<String>)> {
        if let Some(op) = OperationInvoke::from_payload(&payload) {
            let handler = self
                .get_future(&op.function)
                .ok_or_else(|| PortwireError::UnknownFutureOperation(op.function.clone()))?;
            return Ok((handler, Value::Array(op.args), Some(op.function)));
        }

        let handler = self
            .latest_future
            .as_deref()
            .and_then(|name| self.get_future(name))
            .ok_or_else(|| PortwireError::Protocol("no future handler registered".to_string()))?;
        Ok((handler, payload, None))
    }

    /// Pick the stream handler for a payload. See [`HandlerRegistry::resolve_future`].
    pub fn resolve_stream(
        &self,
        payload: Value,
    ) -> Result<(Arc<dyn StreamHandler>, Value, Option<String>)> {
        if let Some(op) = OperationInvoke::from_payload(&payload) {
            let handler = self
                .get_stream(&op.function)
                .ok_or_else(|| PortwireError::UnknownStreamOperation(op.function.clone()))?;
            return Ok((handler, Value::Array(op.args), Some(op.function)));
        }

        let handler = self
            .latest_stream
            .as_deref()
            .and_then(|name| self.get_stream(name))
            .ok_or_else(|| PortwireError::Protocol("no stream handler registered".to_string()))?;
        Ok((handler, payload, None))
    }
}
