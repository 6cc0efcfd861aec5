//! Caller engine - issues future and stream calls over a port.
//!
//! Each call gets a fresh uuid correlation id and its own port listener that
//! only accepts messages bearing that id. The listener lives exactly as long
//! as the call: it is removed when the call settles, or when the call's
//! future or stream is dropped.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use portwire::Caller;
//! use serde_json::json;
//!
//! let caller = Caller::new(port);
//! let sum = caller.call("add", vec![json!(2), json!(3)], None).await?;
//!
//! let mut ticks = caller.stream("ticks", vec![json!(10)])?;
//! while let Some(tick) = ticks.next().await {
//!     println!("tick {}", tick?);
//! }
//! ```

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::{RemoteFn, RemoteStreamFn};
use crate::error::{PortwireError, Result};
use crate::protocol::{CorrelationId, Message, OperationInvoke};
use crate::transport::{lock, ListenerId, MessagePort};

/// Removes a port listener when dropped.
struct ListenerGuard {
    port: MessagePort,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.port.remove_listener(self.id);
    }
}

fn next_correlation_id() -> CorrelationId {
    CorrelationId::Str(Uuid::new_v4().to_string())
}

/// Issues calls to a responder on the other end of a port.
///
/// Cheap to clone; clones share the port.
#[derive(Clone, Debug)]
pub struct Caller {
    port: MessagePort,
}

impl Caller {
    pub fn new(port: MessagePort) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Call the future operation `name` with positional `args`.
    ///
    /// See [`Caller::call_raw`] for cancellation and errors.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        let payload = OperationInvoke::new(name, args).to_payload()?;
        self.call_raw(payload, cancel).await
    }

    /// Send a `future_call` with an arbitrary payload and wait for its outcome.
    ///
    /// Cancelling `cancel` sends one `abort` and keeps waiting: the responder
    /// still answers, usually with a rejection.
    ///
    /// # Errors
    ///
    /// - [`PortwireError::Remote`] with the peer's error value on `rejected`
    /// - [`PortwireError::ConnectionClosed`] if the port closes first
    /// - [`PortwireError::PortClosed`] if this port was already closed
    pub async fn call_raw(&self, payload: Value, cancel: Option<CancellationToken>) -> Result<Value> {
        let id = next_correlation_id();
        let (tx, mut rx) = oneshot::channel::<Result<Value>>();
        let tx = Mutex::new(Some(tx));

        let expected = id.clone();
        let listener = self.port.on_message(move |envelope| {
            let Ok(message) = envelope.message() else {
                return;
            };
            if message.correlation_id() != Some(&expected) {
                return;
            }
            let outcome = match message {
                Message::Resolved { data, .. } => Ok(data),
                Message::Rejected { error, .. } => Err(PortwireError::Remote(error)),
                other => Err(PortwireError::Protocol(format!(
                    "Invalid message type for future call: {}",
                    other.kind()
                ))),
            };
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(outcome);
            }
        });
        let _guard = ListenerGuard {
            port: self.port.clone(),
            id: listener,
        };

        self.port.send_message(&Message::future_call(id.clone(), payload))?;

        let outcome = match cancel {
            Some(token) => {
                let settled = tokio::select! {
                    outcome = &mut rx => Some(outcome),
                    _ = token.cancelled() => None,
                };
                match settled {
                    Some(outcome) => outcome,
                    None => {
                        tracing::debug!("Aborting call {}", id);
                        if let Err(e) = self.port.send_message(&Message::abort(id.clone())) {
                            tracing::debug!("Failed to send abort for {}: {}", id, e);
                        }
                        rx.await
                    }
                }
            }
            None => rx.await,
        };

        // A dropped sender means the listener went away with the port.
        outcome.unwrap_or(Err(PortwireError::ConnectionClosed))
    }

    /// Open a stream call on the operation `name` with positional `args`.
    ///
    /// Nothing is sent until the stream is first polled.
    pub fn stream(&self, name: &str, args: Vec<Value>) -> Result<CallerStream> {
        let payload = OperationInvoke::new(name, args).to_payload()?;
        Ok(self.stream_raw(payload))
    }

    /// Open a stream call with an arbitrary payload.
    pub fn stream_raw(&self, payload: Value) -> CallerStream {
        CallerStream {
            port: self.port.clone(),
            id: next_correlation_id(),
            payload: Some(payload),
            rx: None,
            guard: None,
            finished: false,
        }
    }

    /// Typed handle for a remote future operation.
    pub fn future_fn<A, R>(&self, name: &str) -> RemoteFn<A, R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        RemoteFn::new(self.clone(), name)
    }

    /// Typed handle for a remote stream operation.
    pub fn stream_fn<A, R>(&self, name: &str) -> RemoteStreamFn<A, R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        RemoteStreamFn::new(self.clone(), name)
    }

    /// Close the port. Outstanding calls fail with
    /// [`PortwireError::ConnectionClosed`].
    pub fn close(&self) {
        self.port.close();
    }
}

/// Values of one stream call.
///
/// Yields each `stream_emit` value, then ends on `stream_complete`. A
/// `stream_error` is yielded as an `Err` and ends the stream. Dropping the
/// stream before it ends sends `stream_unsubscribe`.
pub struct CallerStream {
    port: MessagePort,
    id: CorrelationId,
    /// Present until the subscription is sent.
    payload: Option<Value>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    guard: Option<ListenerGuard>,
    finished: bool,
}

impl CallerStream {
    /// The correlation id of this call.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Whether the subscription has been sent.
    pub fn is_subscribed(&self) -> bool {
        self.payload.is_none()
    }

    /// Stop the call. Sends `stream_unsubscribe` if the stream is live.
    pub fn unsubscribe(&mut self) {
        if self.is_subscribed() && !self.finished {
            if let Err(e) = self.port.send_message(&Message::stream_unsubscribe(self.id.clone())) {
                tracing::debug!("Failed to unsubscribe {}: {}", self.id, e);
            }
        }
        self.finish();
    }

    fn subscribe(&mut self, payload: Value) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let expected = self.id.clone();
        let listener = self.port.on_message(move |envelope| {
            let Ok(message) = envelope.message() else {
                return;
            };
            if message.correlation_id() != Some(&expected) {
                return;
            }
            if matches!(
                message,
                Message::StreamEmit { .. } | Message::StreamComplete { .. } | Message::StreamError { .. }
            ) {
                let _ = tx.send(message);
            }
        });
        self.guard = Some(ListenerGuard {
            port: self.port.clone(),
            id: listener,
        });
        self.rx = Some(rx);

        self.port
            .send_message(&Message::stream_subscribe(self.id.clone(), payload))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard = None;
        self.rx = None;
    }
}

impl Stream for CallerStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(payload) = this.payload.take() {
            if let Err(e) = this.subscribe(payload) {
                this.finish();
                return Poll::Ready(Some(Err(e)));
            }
        }

        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };

        match rx.poll_recv(cx) {
            Poll::Ready(Some(Message::StreamEmit { data, .. })) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(Some(Message::StreamError { error, .. })) => {
                this.finish();
                Poll::Ready(Some(Err(PortwireError::Remote(error))))
            }
            Poll::Ready(Some(_)) => {
                // stream_complete
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(Err(PortwireError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallerStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
