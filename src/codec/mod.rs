//! Codec module - conversion between Rust values and wire payloads.
//!
//! - [`JsonCodec`] - typed values to and from the opaque JSON payloads carried
//!   by messages
//! - [`MsgPackCodec`] - message envelopes to and from MessagePack bytes for
//!   byte-stream transports
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//!
//! # Example
//!
//! ```
//! use portwire::codec::{JsonCodec, MsgPackCodec};
//! use serde_json::json;
//!
//! let payload = JsonCodec::encode(&("add", 2)).unwrap();
//! assert_eq!(payload, json!(["add", 2]));
//!
//! let bytes = MsgPackCodec::encode(&payload).unwrap();
//! let back: serde_json::Value = MsgPackCodec::decode(&bytes).unwrap();
//! assert_eq!(back, payload);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
