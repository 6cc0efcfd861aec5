//! Message ports carried over a byte stream.
//!
//! [`StreamTransport::spawn`] bridges a [`MessagePort`] onto any
//! `AsyncRead`/`AsyncWrite` pair (a child process's stdio, a Unix socket, a
//! `tokio::io::duplex` pipe). Messages travel as length-prefixed MessagePack
//! frames.
//!
//! # Architecture
//!
//! ```text
//! local port ─► bridge port listener ─► mpsc<Bytes> ─► Writer Task ─► stream
//! local port ◄─ bridge port.send    ◄─ Reader Task ◄─ FrameBuffer ◄─ stream
//! ```
//!
//! Transferred ports cannot cross a byte stream: envelopes carrying ports are
//! dropped with a warning, so the connection handshake only works in-process.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::port::{MessageChannel, MessagePort};
use crate::error::{PortwireError, Result};
use crate::protocol::{decode_message_frame, encode_message_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE};

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for a byte-stream transport.
#[derive(Debug, Clone)]
pub struct StreamTransportConfig {
    /// Largest frame accepted from the peer.
    pub max_frame_size: u32,
    /// Size of the buffer used for each read.
    pub read_buffer_size: usize,
}

impl Default for StreamTransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// A running byte-stream bridge.
pub struct StreamTransport {
    port: MessagePort,
    reader_task: JoinHandle<Result<()>>,
    writer_task: JoinHandle<Result<()>>,
}

impl StreamTransport {
    /// Spawn reader and writer tasks and return the bridged port.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, config: StreamTransportConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (local, bridge) = MessageChannel::new();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Bytes>();

        bridge.on_message(move |envelope| {
            if !envelope.ports.is_empty() {
                tracing::warn!("Dropping message with transferred ports: ports cannot cross a byte stream");
                return;
            }
            match encode_message_frame(&envelope.data) {
                Ok(frame) => {
                    if frame_tx.send(frame).is_err() {
                        tracing::debug!("Writer task gone, dropping outbound frame");
                    }
                }
                Err(e) => tracing::error!("Failed to encode outbound frame: {}", e),
            }
        });

        let writer_task = tokio::spawn(writer_loop(frame_rx, writer));
        let reader_task = tokio::spawn(async move {
            let result = read_loop(reader, &bridge, &config).await;
            if let Err(e) = &result {
                tracing::error!("Read loop error: {}", e);
            }
            // Ends the writer too: closing clears the listener holding frame_tx.
            bridge.close();
            result
        });

        Self {
            port: local,
            reader_task,
            writer_task,
        }
    }

    /// Spawn with default configuration.
    pub fn spawn_default<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(reader, writer, StreamTransportConfig::default())
    }

    /// The port whose traffic is carried by the stream.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Wait until the peer closes the stream (or reading fails).
    pub async fn closed(self) -> Result<()> {
        let result = self
            .reader_task
            .await
            .map_err(|e| PortwireError::Protocol(format!("reader task failed: {}", e)))?;
        let _ = self.writer_task.await;
        result
    }
}

/// Read frames and forward them onto the bridge port.
async fn read_loop<R>(mut reader: R, bridge: &MessagePort, config: &StreamTransportConfig) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(config.max_frame_size);
    let mut buf = vec![0u8; config.read_buffer_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Connection closed
            Ok(n) => n,
            Err(e) => return Err(PortwireError::Io(e)),
        };

        for payload in frame_buffer.push(&buf[..n])? {
            let message = match decode_message_frame(&payload) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Dropping undecodable frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = bridge.send(message) {
                tracing::debug!("Local port gone, stopping reader: {}", e);
                return Ok(());
            }
        }
    }
}

/// Receive frames and write them in batches.
async fn writer_loop<W>(mut rx: mpsc::UnboundedReceiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // Channel closed, clean shutdown
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        for frame in &batch {
            writer.write_all(frame).await?;
        }
        writer.flush().await?;
    }
}
