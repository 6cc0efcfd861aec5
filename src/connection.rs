//! Connection handshake over a shared parent port.
//!
//! Several logical connections can share one parent channel. The connecting
//! side creates a fresh [`MessageChannel`], keeps one end and posts a
//! `connect` message carrying the other end as a transferred port. The
//! listening side picks up connects addressed to its id and wraps the
//! transferred port. After the handshake the two sides talk only over that
//! private pair, so traffic of one connection is never seen by another.
//!
//! # Example
//!
//! ```ignore
//! use portwire::{AppBuilder, Caller, Connection};
//!
//! // Worker side
//! let handle = Connection::listen("math", &parent, |conn| {
//!     let app = AppBuilder::new(conn.port().clone()).map_future(/* ... */).build();
//!     /* keep `app` alive */
//! });
//!
//! // Host side
//! let conn = Connection::connect("math", &parent)?;
//! let caller = Caller::new(conn.into_port());
//! ```

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{PortwireError, Result};
use crate::protocol::Message;
use crate::transport::{lock, ListenerId, MessageChannel, MessagePort};

/// One end of an established logical connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    port: MessagePort,
}

impl Connection {
    pub fn new(id: impl Into<String>, port: MessagePort) -> Self {
        Self {
            id: id.into(),
            port,
        }
    }

    /// Open a connection named `id` over `parent`.
    ///
    /// Returns immediately; messages sent before the peer listens are
    /// buffered on the private channel.
    pub fn connect(id: &str, parent: &MessagePort) -> Result<Connection> {
        let (local, remote) = MessageChannel::new();
        parent.send_message_with_ports(&Message::connect(id), vec![remote])?;
        tracing::debug!("Sent connect for {}", id);
        Ok(Connection::new(id, local))
    }

    /// Accept every connect addressed to `id` on `parent`, handing each new
    /// connection to `on_connect`.
    ///
    /// Listening starts immediately and runs until the returned handle is
    /// destroyed or dropped.
    pub fn listen<F>(id: &str, parent: &MessagePort, on_connect: F) -> ListenHandle
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        let expected = id.to_string();
        let listener = parent.on_message(move |envelope| {
            let Ok(Message::Connect { id }) = envelope.message() else {
                return;
            };
            if id != expected {
                return;
            }
            match envelope.ports.first() {
                Some(port) => on_connect(Connection::new(id, port.clone())),
                None => tracing::warn!("Connect for {} carried no port", id),
            }
        });

        ListenHandle {
            parent: parent.clone(),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Wait for the first connect addressed to `id` on `parent`.
    ///
    /// # Errors
    ///
    /// [`PortwireError::ConnectionClosed`] if the parent channel closes first.
    pub async fn accept(id: &str, parent: &MessagePort) -> Result<Connection> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Connection::listen(id, parent, move |conn| {
            let _ = tx.send(conn);
        });
        let conn = rx.recv().await.ok_or(PortwireError::ConnectionClosed);
        handle.destroy();
        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The private port of this connection.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    pub fn into_port(self) -> MessagePort {
        self.port
    }

    /// Close the private port.
    pub fn close(&self) {
        self.port.close();
    }
}

/// Stops a [`Connection::listen`] when destroyed or dropped.
///
/// Connections already handed out stay open.
pub struct ListenHandle {
    parent: MessagePort,
    listener: Mutex<Option<ListenerId>>,
}

impl ListenHandle {
    /// Stop listening. Idempotent.
    pub fn destroy(&self) {
        if let Some(id) = lock(&self.listener).take() {
            self.parent.remove_listener(id);
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.listener).is_some()
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (host, worker) = MessageChannel::new();

        let conn = Connection::connect("a", &host).unwrap();
        assert_eq!(conn.id(), "a");

        let accepted = tokio::time::timeout(Duration::from_secs(1), Connection::accept("a", &worker))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.id(), "a");

        let mut inbox = accepted.port().inbox();
        conn.port().send(json!("over the private channel")).unwrap();
        assert_eq!(
            inbox.recv().await.unwrap().data,
            json!("over the private channel")
        );
    }

    #[tokio::test]
    async fn test_listen_ignores_other_ids() {
        let (host, worker) = MessageChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = Connection::listen("b", &worker, move |conn| {
            let _ = tx.send(conn.id().to_string());
        });

        Connection::connect("a", &host).unwrap();
        Connection::connect("b", &host).unwrap();

        assert_eq!(rx.recv().await.unwrap(), "b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (host, worker) = MessageChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = Connection::listen("a", &worker, move |conn| {
            let _ = tx.send(conn);
        });
        assert_eq!(worker.listener_count(), 1);

        handle.destroy();
        handle.destroy();
        assert!(!handle.is_active());
        assert_eq!(worker.listener_count(), 0);

        Connection::connect("a", &host).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_keeps_accepted_connections() {
        let (host, worker) = MessageChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = Connection::listen("a", &worker, move |conn| {
            let _ = tx.send(conn);
        });
        let conn = Connection::connect("a", &host).unwrap();
        let accepted = rx.recv().await.unwrap();

        handle.destroy();

        let mut inbox = accepted.port().inbox();
        conn.port().send(json!(1)).unwrap();
        assert_eq!(inbox.recv().await.unwrap().data, json!(1));
    }

    #[tokio::test]
    async fn test_accept_fails_when_parent_closes() {
        let (host, worker) = MessageChannel::new();
        host.close();

        let result = Connection::accept("a", &worker).await;
        assert!(matches!(result, Err(PortwireError::ConnectionClosed)));
    }
}
