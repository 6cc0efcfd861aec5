//! Handler module - what the responder runs for each call.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps operation names to future and stream handlers
//! - [`CallContext`] - correlation id and cancellation for one call
//! - [`TypedFutureHandler`] / [`TypedStreamHandler`] - serde adapters around
//!   plain async functions and streams
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use futures::stream;
//! use portwire::handler::{HandlerRegistry, TypedFutureHandler, TypedStreamHandler};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register_future_arc("echo", Arc::new(TypedFutureHandler::new(|data: String, _ctx| async move {
//!     Ok(data)
//! })));
//!
//! registry.register_stream_arc("count", Arc::new(TypedStreamHandler::new(|n: u32, _ctx| {
//!     stream::iter((0..n).map(Ok))
//! })));
//! ```

mod context;
mod registry;

pub use context::CallContext;
pub use registry::{
    BoxFuture, FutureHandler, HandlerRegistry, HandlerResult, StreamHandler, TypedFutureHandler,
    TypedStreamHandler, ValueStream,
};
