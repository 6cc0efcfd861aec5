//! The responder's dispatch loop.
//!
//! One task owns the handler registry and the active set. Everything that
//! changes either one arrives as a [`Command`]: inbound messages, handler
//! registrations, handler settlements, stream events, snapshots and
//! shutdown. Handlers themselves run on spawned tasks and report back through
//! the same queue, so per-entry transitions are serialized.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ActiveRequestInfo, RequestKind};
use crate::error::{PortwireError, Result};
use crate::handler::{CallContext, FutureHandler, HandlerRegistry, StreamHandler, ValueStream};
use crate::protocol::{CorrelationId, Message, OperationInvoke};
use crate::transport::MessagePort;

/// Work item for the dispatch loop.
pub(crate) enum Command {
    Inbound(Message),
    RegisterFuture {
        name: String,
        handler: Arc<dyn FutureHandler>,
    },
    RegisterStream {
        name: String,
        handler: Arc<dyn StreamHandler>,
    },
    FutureSettled {
        seq: u64,
        result: Result<Value>,
    },
    Stream {
        seq: u64,
        event: StreamEvent,
    },
    /// Registration is final: calls no handler matches are rejected.
    Seal,
    ActiveRequests(oneshot::Sender<Vec<ActiveRequestInfo>>),
    Shutdown(oneshot::Sender<()>),
}

/// Progress reported by a stream driver task.
pub(crate) enum StreamEvent {
    Item(Value),
    Error(PortwireError),
    Complete,
}

/// One not-yet-terminal call.
struct Entry {
    /// Arrival sequence number, unique for the life of the loop.
    seq: u64,
    id: CorrelationId,
    kind: RequestKind,
    /// Taken on dispatch.
    payload: Option<Value>,
    cancellation: CancellationToken,
    dispatched: bool,
}

pub(crate) struct DispatchLoop {
    port: MessagePort,
    registry: HandlerRegistry,
    /// Arrival order.
    active: Vec<Entry>,
    next_seq: u64,
    /// Dispatch every call on arrival, even with no handler of its kind.
    sealed: bool,
    commands: mpsc::UnboundedSender<Command>,
    close_port_on_shutdown: bool,
}

impl DispatchLoop {
    pub(crate) fn new(
        port: MessagePort,
        commands: mpsc::UnboundedSender<Command>,
        close_port_on_shutdown: bool,
    ) -> Self {
        Self {
            port,
            registry: HandlerRegistry::new(),
            active: Vec::new(),
            next_seq: 1,
            sealed: false,
            commands,
            close_port_on_shutdown,
        }
    }

    /// Process commands until shutdown.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Inbound(message) => self.on_message(message),
                Command::RegisterFuture { name, handler } => {
                    self.registry.register_future_arc(&name, handler);
                    tracing::debug!(
                        "Registered future handler {} (now serving {:?})",
                        name,
                        self.registry.future_names()
                    );
                    self.replay(RequestKind::Future, Some(name.as_str()));
                }
                Command::RegisterStream { name, handler } => {
                    self.registry.register_stream_arc(&name, handler);
                    tracing::debug!(
                        "Registered stream handler {} (now serving {:?})",
                        name,
                        self.registry.stream_names()
                    );
                    self.replay(RequestKind::Stream, Some(name.as_str()));
                }
                Command::Seal => {
                    self.sealed = true;
                    self.replay(RequestKind::Future, None);
                    self.replay(RequestKind::Stream, None);
                }
                Command::FutureSettled { seq, result } => self.settle_future(seq, result),
                Command::Stream { seq, event } => self.on_stream_event(seq, event),
                Command::ActiveRequests(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown(reply) => {
                    self.drain();
                    if self.close_port_on_shutdown {
                        self.port.close();
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::FutureCall { id, data } => {
                let seq = self.push(id, RequestKind::Future, data);
                if self.sealed || self.registry.has_future_handlers() {
                    self.dispatch_future(seq);
                }
            }
            Message::StreamSubscribe { id, data } => {
                let seq = self.push(id, RequestKind::Stream, data);
                if self.sealed || self.registry.has_stream_handlers() {
                    self.dispatch_stream(seq);
                }
            }
            Message::Abort { id } => match self.find(&id, RequestKind::Future) {
                Some(idx) => {
                    // Removal waits for the handler to settle.
                    self.active[idx].cancellation.cancel();
                }
                None => tracing::debug!("Abort for unknown call {}", id),
            },
            Message::StreamUnsubscribe { id } => match self.find(&id, RequestKind::Stream) {
                Some(idx) => {
                    let entry = self.active.remove(idx);
                    entry.cancellation.cancel();
                    tracing::debug!("Stream {} unsubscribed", id);
                }
                None => tracing::debug!("Unsubscribe for unknown stream {}", id),
            },
            other => tracing::debug!("Responder ignoring {} message", other.kind()),
        }
    }

    fn push(&mut self, id: CorrelationId, kind: RequestKind, payload: Value) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.active.push(Entry {
            seq,
            id,
            kind,
            payload: Some(payload),
            cancellation: CancellationToken::new(),
            dispatched: false,
        });
        seq
    }

    /// First entry matching id and kind.
    fn find(&self, id: &CorrelationId, kind: RequestKind) -> Option<usize> {
        self.active
            .iter()
            .position(|e| e.kind == kind && &e.id == id)
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.active.iter().position(|e| e.seq == seq)
    }

    /// Dispatch queued entries of `kind`, in arrival order.
    ///
    /// With `name`, only bare payloads and calls naming that operation are
    /// dispatched; calls naming another operation keep waiting for theirs.
    fn replay(&mut self, kind: RequestKind, name: Option<&str>) {
        let queued: Vec<u64> = self
            .active
            .iter()
            .filter(|e| e.kind == kind && !e.dispatched)
            .filter(|e| match (name, e.payload.as_ref()) {
                (Some(name), Some(payload)) => targets(payload, name),
                _ => true,
            })
            .map(|e| e.seq)
            .collect();

        if !queued.is_empty() {
            tracing::debug!("Replaying {} queued {:?} calls", queued.len(), kind);
        }
        for seq in queued {
            match kind {
                RequestKind::Future => self.dispatch_future(seq),
                RequestKind::Stream => self.dispatch_stream(seq),
            }
        }
    }

    /// Mark an entry dispatched and build its handler context.
    fn begin_dispatch(&mut self, seq: u64) -> Option<(Value, CallContext)> {
        let idx = self.position(seq)?;
        let entry = &mut self.active[idx];
        entry.dispatched = true;
        let payload = entry.payload.take().unwrap_or(Value::Null);
        let ctx = CallContext::with_token(entry.id.clone(), entry.cancellation.clone());
        Some((payload, ctx))
    }

    fn dispatch_future(&mut self, seq: u64) {
        let Some((payload, mut ctx)) = self.begin_dispatch(seq) else {
            return;
        };

        let (handler, payload, operation) = match self.registry.resolve_future(payload) {
            Ok(resolved) => resolved,
            Err(e) => return self.settle_future(seq, Err(e)),
        };
        ctx.set_operation(operation);

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(payload, ctx))) {
            Ok(fut) => fut,
            Err(panic) => {
                return self.settle_future(seq, Err(PortwireError::Panicked(panic_message(panic))))
            }
        };

        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(PortwireError::Panicked(panic_message(panic))),
            };
            let _ = commands.send(Command::FutureSettled { seq, result });
        });
    }

    /// Post the terminal message for a future call, if it is still active.
    fn settle_future(&mut self, seq: u64, result: Result<Value>) {
        let Some(idx) = self.position(seq) else {
            tracing::debug!("Discarding late result for call seq {}", seq);
            return;
        };
        let entry = self.active.remove(idx);

        let message = match result {
            Ok(value) => Message::resolved(entry.id, value),
            Err(e) => {
                tracing::debug!("Future call {} failed: {}", entry.id, e);
                Message::rejected(entry.id, e.to_wire())
            }
        };
        self.post(&message);
    }

    fn dispatch_stream(&mut self, seq: u64) {
        let Some((payload, mut ctx)) = self.begin_dispatch(seq) else {
            return;
        };
        let cancellation = ctx.cancellation().clone();

        let (handler, payload, operation) = match self.registry.resolve_stream(payload) {
            Ok(resolved) => resolved,
            Err(e) => return self.on_stream_event(seq, StreamEvent::Error(e)),
        };
        ctx.set_operation(operation);

        let stream = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(payload, ctx))) {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.on_stream_event(seq, StreamEvent::Error(e)),
            Err(panic) => {
                let e = PortwireError::Panicked(panic_message(panic));
                return self.on_stream_event(seq, StreamEvent::Error(e));
            }
        };

        tokio::spawn(drive_stream(seq, stream, cancellation, self.commands.clone()));
    }

    fn on_stream_event(&mut self, seq: u64, event: StreamEvent) {
        // Absent once terminated, unsubscribed or drained.
        let Some(idx) = self.position(seq) else {
            return;
        };

        match event {
            StreamEvent::Item(value) => {
                let message = Message::stream_emit(self.active[idx].id.clone(), value);
                self.post(&message);
            }
            StreamEvent::Error(e) => {
                let entry = self.active.remove(idx);
                entry.cancellation.cancel();
                tracing::debug!("Stream {} failed: {}", entry.id, e);
                self.post(&Message::stream_error(entry.id, e.to_wire()));
            }
            StreamEvent::Complete => {
                let entry = self.active.remove(idx);
                entry.cancellation.cancel();
                self.post(&Message::stream_complete(entry.id));
            }
        }
    }

    fn snapshot(&self) -> Vec<ActiveRequestInfo> {
        self.active
            .iter()
            .map(|e| ActiveRequestInfo {
                id: e.id.clone(),
                kind: e.kind,
                dispatched: e.dispatched,
            })
            .collect()
    }

    /// Fail everything still active, oldest first.
    fn drain(&mut self) {
        let closed = PortwireError::ConnectionClosed.to_wire();
        let entries = std::mem::take(&mut self.active);
        if !entries.is_empty() {
            tracing::debug!("Draining {} active calls on shutdown", entries.len());
        }

        for entry in entries {
            entry.cancellation.cancel();
            let message = match entry.kind {
                RequestKind::Future => Message::rejected(entry.id, closed.clone()),
                RequestKind::Stream => Message::stream_error(entry.id, closed.clone()),
            };
            self.post(&message);
        }
    }

    fn post(&self, message: &Message) {
        if let Err(e) = self.port.send_message(message) {
            tracing::error!("Failed to post {}: {}", message.kind(), e);
        }
    }
}

/// Whether a queued payload may be served by the operation `name`.
fn targets(payload: &Value, name: &str) -> bool {
    OperationInvoke::from_payload(payload).map_or(true, |op| op.function == name)
}

/// Pull items from a stream handler and report them to the loop.
async fn drive_stream(
    seq: u64,
    mut stream: ValueStream,
    cancellation: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return,
            next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
        };

        let event = match next {
            Ok(Some(Ok(value))) => StreamEvent::Item(value),
            Ok(Some(Err(e))) => StreamEvent::Error(e),
            Ok(None) => StreamEvent::Complete,
            Err(panic) => StreamEvent::Error(PortwireError::Panicked(panic_message(panic))),
        };
        let terminal = !matches!(event, StreamEvent::Item(_));

        if commands.send(Command::Stream { seq, event }).is_err() || terminal {
            return;
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
