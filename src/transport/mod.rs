//! Transport module - the duplex channels messages travel on.
//!
//! - [`MessageChannel`] / [`MessagePort`]: in-process linked ports, transferable
//!   inside an [`Envelope`]
//! - [`StreamTransport`]: a port bridged over an `AsyncRead`/`AsyncWrite` pair

mod port;
mod stream;

pub(crate) use port::lock;
pub use port::{Envelope, Inbox, Listener, ListenerId, MessageChannel, MessagePort};
pub use stream::{StreamTransport, StreamTransportConfig, DEFAULT_READ_BUFFER_SIZE};
