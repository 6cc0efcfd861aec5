//! Typed builders for both ends of a connection.
//!
//! [`AppBuilder`] collects named handlers and yields a started
//! [`Responder`]. On the calling side, [`RemoteFn`] and [`RemoteStreamFn`]
//! (obtained from [`Caller::future_fn`] and [`Caller::stream_fn`]) give one
//! typed method per remote operation.
//!
//! Arguments travel as a JSON array: tuples serialize positionally and a
//! single non-array value is wrapped in a one-element array.
//!
//! # Example
//!
//! ```ignore
//! use portwire::{AppBuilder, Caller, MessageChannel};
//!
//! let (client_port, app_port) = MessageChannel::new();
//!
//! let _app = AppBuilder::new(app_port)
//!     .map_future("add", |(a, b): (i64, i64), _ctx| async move { Ok(a + b) })
//!     .build();
//!
//! let add = Caller::new(client_port).future_fn::<(i64, i64), i64>("add");
//! assert_eq!(add.call(&(2, 3)).await?, 5);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::caller::Caller;
use crate::codec::JsonCodec;
use crate::error::Result;
use crate::handler::{
    CallContext, FutureHandler, HandlerResult, StreamHandler, TypedFutureHandler,
    TypedStreamHandler,
};
use crate::responder::{Responder, ResponderConfig};
use crate::transport::MessagePort;

enum Registration {
    Future(String, Arc<dyn FutureHandler>),
    Stream(String, Arc<dyn StreamHandler>),
}

/// Builder for a responder serving named operations.
pub struct AppBuilder {
    port: MessagePort,
    config: ResponderConfig,
    /// In registration order.
    registrations: Vec<Registration>,
}

impl AppBuilder {
    pub fn new(port: MessagePort) -> Self {
        Self {
            port,
            config: ResponderConfig::default(),
            registrations: Vec::new(),
        }
    }

    /// Map a future operation. A later mapping of the same name wins.
    pub fn map_future<F, T, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.registrations.push(Registration::Future(
            name.to_string(),
            Arc::new(TypedFutureHandler::new(handler)),
        ));
        self
    }

    /// Map a stream operation. A later mapping of the same name wins.
    pub fn map_stream<F, T, R, S>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T, CallContext) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        S: Stream<Item = HandlerResult<R>> + Send + 'static,
    {
        self.registrations.push(Registration::Stream(
            name.to_string(),
            Arc::new(TypedStreamHandler::new(handler)),
        ));
        self
    }

    /// Close the port when the responder shuts down.
    ///
    /// Default: false
    pub fn close_port_on_shutdown(mut self, close: bool) -> Self {
        self.config.close_port_on_shutdown = close;
        self
    }

    /// Create the responder, register every mapping, seal it and start it.
    ///
    /// Calls for an operation that was not mapped are rejected, even when no
    /// operation of that kind was mapped at all.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Responder {
        let responder = Responder::new(self.port, self.config);
        for registration in self.registrations {
            match registration {
                Registration::Future(name, handler) => responder.register_future_arc(&name, handler),
                Registration::Stream(name, handler) => responder.register_stream_arc(&name, handler),
            }
        }
        responder.seal();
        responder.start();
        responder
    }
}

/// Typed handle for a remote future operation.
pub struct RemoteFn<A, R> {
    caller: Caller,
    name: String,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteFn<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub(crate) fn new(caller: Caller, name: &str) -> Self {
        Self {
            caller,
            name: name.to_string(),
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: &A) -> Result<R> {
        self.invoke(args, None).await
    }

    /// Call with a cancellation token; see [`Caller::call_raw`].
    pub async fn call_with_cancel(&self, args: &A, cancel: CancellationToken) -> Result<R> {
        self.invoke(args, Some(cancel)).await
    }

    async fn invoke(&self, args: &A, cancel: Option<CancellationToken>) -> Result<R> {
        let args = JsonCodec::encode_args(args)?;
        let value = self.caller.call(&self.name, args, cancel).await?;
        JsonCodec::decode(value)
    }
}

impl<A, R> Clone for RemoteFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller.clone(),
            name: self.name.clone(),
            _phantom: PhantomData,
        }
    }
}

/// Typed handle for a remote stream operation.
pub struct RemoteStreamFn<A, R> {
    caller: Caller,
    name: String,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteStreamFn<A, R>
where
    A: Serialize,
    R: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(caller: Caller, name: &str) -> Self {
        Self {
            caller,
            name: name.to_string(),
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the stream. Dropping it unsubscribes.
    pub fn subscribe(&self, args: &A) -> Result<BoxStream<'static, Result<R>>> {
        let args = JsonCodec::encode_args(args)?;
        let stream = self.caller.stream(&self.name, args)?;
        Ok(stream
            .map(|item| item.and_then(JsonCodec::decode::<R>))
            .boxed())
    }
}

impl<A, R> Clone for RemoteStreamFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller.clone(),
            name: self.name.clone(),
            _phantom: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortwireError;
    use crate::transport::MessageChannel;
    use futures::stream;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn app(port: MessagePort) -> Responder {
        AppBuilder::new(port)
            .map_future("add", |(a, b): (i64, i64), _ctx| async move { Ok(a + b) })
            .map_future("echo", |s: String, _ctx| async move { Ok(s) })
            .map_future("shift", |p: Point, _ctx| async move {
                Ok(Point { x: p.x + 1, y: p.y + 1 })
            })
            .map_future("fail", |_: (), _ctx| async move {
                Err::<(), _>(PortwireError::handler("always fails"))
            })
            .map_stream("count", |n: u32, _ctx| stream::iter((0..n).map(Ok)))
            .build()
    }

    #[tokio::test]
    async fn test_tuple_arguments() {
        let (client, server) = MessageChannel::new();
        let _app = app(server);

        let add = Caller::new(client).future_fn::<(i64, i64), i64>("add");
        assert_eq!(add.call(&(2, 3)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_single_argument_is_wrapped() {
        let (client, server) = MessageChannel::new();
        let _app = app(server);
        let caller = Caller::new(client);

        let echo = caller.future_fn::<String, String>("echo");
        assert_eq!(echo.call(&"hi".to_string()).await.unwrap(), "hi");

        let shift = caller.future_fn::<Point, Point>("shift");
        assert_eq!(
            shift.call(&Point { x: 1, y: 2 }).await.unwrap(),
            Point { x: 2, y: 3 }
        );
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client, server) = MessageChannel::new();
        let _app = app(server);

        let fail = Caller::new(client).future_fn::<(), ()>("fail");
        let err = fail.call(&()).await.unwrap_err();
        assert_eq!(err.to_string(), "always fails");
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (client, server) = MessageChannel::new();
        let _app = app(server);

        let missing = Caller::new(client).future_fn::<(), ()>("missing");
        let err = missing.call(&()).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown promise function: missing");
    }

    #[tokio::test]
    async fn test_app_without_future_mappings_rejects() {
        let (client, server) = MessageChannel::new();
        let _app = AppBuilder::new(server)
            .map_stream("s", |n: u32, _ctx| stream::iter(vec![Ok(n)]))
            .build();

        let nope = Caller::new(client).future_fn::<(), ()>("nope");
        let err = tokio::time::timeout(Duration::from_secs(1), nope.call(&()))
            .await
            .expect("call never settled")
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown promise function: nope");
    }

    #[tokio::test]
    async fn test_empty_app_rejects_streams() {
        let (client, server) = MessageChannel::new();
        let _app = AppBuilder::new(server).build();

        let mut items = Caller::new(client).stream("ticks", vec![]).unwrap();
        let item = tokio::time::timeout(Duration::from_secs(1), items.next())
            .await
            .expect("stream never settled")
            .unwrap();
        assert_eq!(
            item.unwrap_err().to_string(),
            "Unknown observable function: ticks"
        );
    }

    #[tokio::test]
    async fn test_typed_stream() {
        let (client, server) = MessageChannel::new();
        let _app = app(server);

        let count = Caller::new(client).stream_fn::<u32, u32>("count");
        let items: Vec<u32> = count
            .subscribe(&3)
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_call_with_cancel() {
        let (client, server) = MessageChannel::new();
        let _app = AppBuilder::new(server)
            .map_future("wait", |_: (), ctx: CallContext| async move {
                tokio::select! {
                    _ = ctx.cancelled() => Err(PortwireError::handler("cancelled")),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
                }
            })
            .build();

        let wait = Caller::new(client).future_fn::<(), ()>("wait");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = wait.call_with_cancel(&(), token).await.unwrap_err();
        assert_eq!(err.to_string(), "cancelled");
    }

    #[tokio::test]
    async fn test_shutdown_closes_port_when_configured() {
        let (_client, server) = MessageChannel::new();
        let app = AppBuilder::new(server.clone())
            .close_port_on_shutdown(true)
            .build();
        assert!(app.is_started());

        app.shutdown().await;
        assert!(server.is_closed());
    }
}
