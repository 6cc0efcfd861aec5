//! Responder engine - serves future and stream calls arriving on a port.
//!
//! A [`Responder`] is a handle to a dispatch loop task that owns the handler
//! registry and the set of active calls:
//! - calls that arrive before any handler of their kind is registered stay
//!   queued and are replayed, in arrival order, when a matching one is
//!   registered; a call naming another operation keeps waiting for its own
//! - after [`Responder::seal`], calls no handler matches are rejected
//!   instead of queued
//! - every call gets exactly one terminal message (`resolved`/`rejected`,
//!   `stream_complete`/`stream_error`), or none if the caller unsubscribed
//! - [`Responder::shutdown`] fails everything still active, oldest first,
//!   with `"Connection closed"`
//!
//! # Example
//!
//! ```ignore
//! use portwire::{MessageChannel, Responder, ResponderConfig};
//!
//! let (caller_port, responder_port) = MessageChannel::new();
//! let responder = Responder::new(responder_port, ResponderConfig::default());
//! responder.register_future_handler("greet", |name: String, _ctx| async move {
//!     Ok(format!("hello {}", name))
//! });
//! responder.start();
//! ```

mod dispatch;

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::PortwireError;
use crate::handler::{
    CallContext, FutureHandler, HandlerResult, StreamHandler, TypedFutureHandler,
    TypedStreamHandler,
};
use crate::protocol::CorrelationId;
use crate::transport::{lock, ListenerId, MessagePort};
use dispatch::{Command, DispatchLoop};

/// Default for [`ResponderConfig::close_port_on_shutdown`].
pub const DEFAULT_CLOSE_PORT_ON_SHUTDOWN: bool = false;

/// Responder configuration.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Close the bound port after shutdown. Set this when the responder owns
    /// a per-connection port.
    pub close_port_on_shutdown: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            close_port_on_shutdown: DEFAULT_CLOSE_PORT_ON_SHUTDOWN,
        }
    }
}

/// Which call shape an active entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Future,
    Stream,
}

/// Snapshot of one active call.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRequestInfo {
    pub id: CorrelationId,
    pub kind: RequestKind,
    /// False while the call waits for a handler.
    pub dispatched: bool,
}

/// Handle to a running responder.
pub struct Responder {
    port: MessagePort,
    commands: mpsc::UnboundedSender<Command>,
    listener: Mutex<Option<ListenerId>>,
}

impl Responder {
    /// Create a responder bound to `port` and spawn its dispatch loop.
    ///
    /// Nothing is received until [`Responder::start`]. Must be called inside
    /// a Tokio runtime.
    pub fn new(port: MessagePort, config: ResponderConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let dispatch =
            DispatchLoop::new(port.clone(), commands.clone(), config.close_port_on_shutdown);
        tokio::spawn(dispatch.run(rx));

        Self {
            port,
            commands,
            listener: Mutex::new(None),
        }
    }

    /// The bound port.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Register a typed future handler, replacing any prior one under `name`.
    ///
    /// Calls already queued are dispatched right after registration.
    pub fn register_future_handler<F, T, R, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.register_future_arc(name, Arc::new(TypedFutureHandler::new(handler)));
    }

    /// Register an untyped future handler.
    pub fn register_future_arc(&self, name: &str, handler: Arc<dyn FutureHandler>) {
        self.command(Command::RegisterFuture {
            name: name.to_string(),
            handler,
        });
    }

    /// Register a typed stream handler, replacing any prior one under `name`.
    ///
    /// Subscriptions already queued are dispatched right after registration.
    pub fn register_stream_handler<F, T, R, S>(&self, name: &str, handler: F)
    where
        F: Fn(T, CallContext) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        S: Stream<Item = HandlerResult<R>> + Send + 'static,
    {
        self.register_stream_arc(name, Arc::new(TypedStreamHandler::new(handler)));
    }

    /// Register an untyped stream handler.
    pub fn register_stream_arc(&self, name: &str, handler: Arc<dyn StreamHandler>) {
        self.command(Command::RegisterStream {
            name: name.to_string(),
            handler,
        });
    }

    /// Declare the registered handlers final.
    ///
    /// Queued calls are dispatched, and from now on a call that no handler
    /// matches is rejected (`Unknown promise function: <name>` and friends)
    /// instead of waiting. Handlers may still be registered afterwards.
    pub fn seal(&self) {
        self.command(Command::Seal);
    }

    /// Begin receiving on the bound port. A second call is a no-op.
    pub fn start(&self) {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            tracing::warn!("Responder on port {} already started", self.port.id());
            return;
        }

        let commands = self.commands.clone();
        let id = self.port.on_message(move |envelope| match envelope.message() {
            Ok(message) => {
                let _ = commands.send(Command::Inbound(message));
            }
            Err(PortwireError::UnknownKind(kind)) => {
                tracing::warn!("Ignoring message with unknown kind {}", kind);
            }
            Err(e) => tracing::warn!("Ignoring undecodable message: {}", e),
        });
        *listener = Some(id);
    }

    /// Whether [`Responder::start`] has run and shutdown has not.
    pub fn is_started(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Snapshot of the active set, in arrival order.
    ///
    /// Empty once the responder has shut down.
    pub async fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ActiveRequests(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Fail every active call with `"Connection closed"` (oldest first),
    /// cancel in-flight handlers and stop listening.
    ///
    /// Results that settle afterwards are discarded. Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }

        if let Some(id) = lock(&self.listener).take() {
            self.port.remove_listener(id);
        }
        tracing::debug!("Responder on port {} shut down", self.port.id());
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Responder on port {} is shut down", self.port.id());
        }
    }
}

impl Drop for Responder {
    /// Shuts down without waiting for the drain to finish.
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown(tx));

        if let Some(id) = lock(&self.listener).take() {
            self.port.remove_listener(id);
        }
    }
}
