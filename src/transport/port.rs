//! In-process duplex message ports.
//!
//! [`MessageChannel::new`] returns two linked [`MessagePort`]s: an
//! [`Envelope`] posted on one is delivered to the listeners of the other, in
//! send order. Envelopes sent before the receiving side has a listener are
//! buffered until it starts.
//!
//! Each port runs a pump task (spawned on first listener) that hands every
//! incoming envelope to each registered listener in registration order.
//! Listeners run on the pump task and must not block.
//!
//! # Example
//!
//! ```ignore
//! use portwire::transport::MessageChannel;
//! use serde_json::json;
//!
//! let (a, b) = MessageChannel::new();
//! let mut inbox = b.inbox();
//! a.send(json!({"hello": "world"}))?;
//! let envelope = inbox.recv().await.unwrap();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PortwireError, Result};
use crate::protocol::Message;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A wire message plus the ports transferred alongside it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The JSON wire message.
    pub data: Value,
    /// Ports handed over to the receiver.
    pub ports: Vec<MessagePort>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_ports(data: Value, ports: Vec<MessagePort>) -> Self {
        Self { data, ports }
    }

    /// Decode the wire message.
    pub fn message(&self) -> Result<Message> {
        Message::decode(&self.data)
    }
}

/// Callback invoked for every envelope delivered to a port.
pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Factory for linked port pairs.
pub struct MessageChannel;

impl MessageChannel {
    /// Create two linked ports.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        // port1 sends into port2's inbox and vice versa
        let port1 = MessagePort::from_parts(tx2, rx1);
        let port2 = MessagePort::from_parts(tx1, rx2);
        (port1, port2)
    }
}

struct PortInner {
    id: u64,
    peer: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    listeners: Arc<Mutex<Vec<(ListenerId, Listener)>>>,
    next_listener_id: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

/// One end of a duplex message channel.
///
/// Cheap to clone; clones refer to the same endpoint.
#[derive(Clone)]
pub struct MessagePort {
    inner: Arc<PortInner>,
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessagePort {
    fn from_parts(
        peer: mpsc::UnboundedSender<Envelope>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                peer: Mutex::new(Some(peer)),
                inbox: Mutex::new(Some(inbox)),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_listener_id: AtomicU64::new(1),
                pump: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique identifier, for diagnostics.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Post an envelope to the peer.
    ///
    /// # Errors
    ///
    /// - [`PortwireError::PortClosed`] if this port was closed
    /// - [`PortwireError::ConnectionClosed`] if the peer is gone
    pub fn post(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(PortwireError::PortClosed);
        }
        match lock(&self.inner.peer).as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| PortwireError::ConnectionClosed),
            None => Err(PortwireError::PortClosed),
        }
    }

    /// Post a raw JSON value with no transferred ports.
    pub fn send(&self, data: Value) -> Result<()> {
        self.post(Envelope::new(data))
    }

    /// Encode and post a protocol message.
    pub fn send_message(&self, message: &Message) -> Result<()> {
        self.post(Envelope::new(message.encode()?))
    }

    /// Encode and post a protocol message, transferring ports to the peer.
    pub fn send_message_with_ports(&self, message: &Message, ports: Vec<MessagePort>) -> Result<()> {
        self.post(Envelope::with_ports(message.encode()?, ports))
    }

    /// Register a listener and start delivery.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        self.start();
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Start delivering buffered and future envelopes to listeners.
    ///
    /// Called implicitly by [`MessagePort::on_message`]. Must run inside a
    /// Tokio runtime; otherwise delivery stays paused until the next call.
    pub fn start(&self) {
        if self.is_closed() {
            return;
        }
        let mut pump = lock(&self.inner.pump);
        if pump.is_some() {
            return;
        }
        let Some(rx) = lock(&self.inner.inbox).take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let listeners = self.inner.listeners.clone();
                *pump = Some(handle.spawn(pump_loop(rx, listeners)));
            }
            Err(_) => {
                tracing::warn!("MessagePort {} started outside a Tokio runtime", self.inner.id);
                *lock(&self.inner.inbox) = Some(rx);
            }
        }
    }

    /// Close this end. Pending deliveries are dropped, listeners released,
    /// and the peer's sends start failing. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.inner.peer).take();
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
        lock(&self.inner.inbox).take();
        lock(&self.inner.listeners).clear();
        tracing::debug!("MessagePort {} closed", self.inner.id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Subscribe to incoming envelopes as an async queue.
    ///
    /// The listener is removed when the [`Inbox`] is dropped.
    pub fn inbox(&self) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.on_message(move |envelope| {
            let _ = tx.send(envelope.clone());
        });
        Inbox {
            port: self.clone(),
            listener,
            rx,
        }
    }
}

async fn pump_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    listeners: Arc<Mutex<Vec<(ListenerId, Listener)>>>,
) {
    while let Some(envelope) = rx.recv().await {
        // Snapshot so listeners can add or remove listeners while running.
        let snapshot: Vec<Listener> = lock(&listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(&envelope);
        }
    }
    // Peer is gone; nothing more will arrive.
    lock(&listeners).clear();
}

/// Async queue of envelopes delivered to a port.
pub struct Inbox {
    port: MessagePort,
    listener: ListenerId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    /// Next envelope. Returns `None` once the port is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next envelope that decodes as a protocol message; others are skipped.
    pub async fn recv_message(&mut self) -> Option<Message> {
        while let Some(envelope) = self.rx.recv().await {
            match envelope.message() {
                Ok(message) => return Some(message),
                Err(e) => tracing::debug!("Inbox skipping undecodable envelope: {}", e),
            }
        }
        None
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.port.remove_listener(self.listener);
    }
}
