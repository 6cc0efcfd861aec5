//! # portwire
//!
//! Future and stream calls multiplexed over a duplex message port.
//!
//! Two isolated contexts (tasks, workers, processes) that share a
//! [`MessagePort`] pair can call each other with two call shapes:
//!
//! - **future calls** - one request, exactly one `resolved`/`rejected` reply,
//!   cancellable with `abort`
//! - **stream calls** - one subscription, any number of `stream_emit`
//!   values, then exactly one `stream_complete`/`stream_error`
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): versioned JSON messages tagged with `kind`
//! - **Transport** ([`transport`]): in-process ports, or ports bridged over any
//!   byte stream with length-prefixed MessagePack frames
//! - **Responder** ([`Responder`]): serves calls through a single dispatch loop
//! - **Caller** ([`Caller`]): issues calls and correlates replies
//! - **Handshake** ([`Connection`]): private channels for named connections
//!   over a shared parent port
//!
//! ## Example
//!
//! ```ignore
//! use portwire::{AppBuilder, Caller, MessageChannel};
//!
//! #[tokio::main]
//! async fn main() -> portwire::Result<()> {
//!     let (client_port, app_port) = MessageChannel::new();
//!
//!     let app = AppBuilder::new(app_port)
//!         .map_future("greet", |name: String, _ctx| async move {
//!             Ok(format!("hello {}", name))
//!         })
//!         .build();
//!
//!     let greet = Caller::new(client_port).future_fn::<String, String>("greet");
//!     println!("{}", greet.call(&"world".to_string()).await?);
//!
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod responder;
pub mod transport;

mod builder;
mod caller;
mod connection;

pub use builder::{AppBuilder, RemoteFn, RemoteStreamFn};
pub use caller::{Caller, CallerStream};
pub use connection::{Connection, ListenHandle};
pub use error::{PortwireError, Result};
pub use handler::CallContext;
pub use protocol::{CorrelationId, Message};
pub use responder::{ActiveRequestInfo, RequestKind, Responder, ResponderConfig};
pub use transport::{MessageChannel, MessagePort, StreamTransport};
