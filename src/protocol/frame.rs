//! Length-prefixed frames for byte-stream transports.
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ Length     │ MessagePack-encoded message  │
//! │ 4 bytes BE │ Length bytes                 │
//! └────────────┴──────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::codec::MsgPackCodec;
use crate::error::{PortwireError, Result};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Build a frame from an already encoded payload.
pub fn build_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        PortwireError::Protocol(format!("frame payload of {} bytes is too large", payload.len()))
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode a wire message into a complete frame.
pub fn encode_message_frame(message: &Value) -> Result<Bytes> {
    let payload = MsgPackCodec::encode(message)?;
    build_frame(&payload)
}

/// Decode a frame payload (without its length prefix) into a wire message.
pub fn decode_message_frame(payload: &[u8]) -> Result<Value> {
    MsgPackCodec::decode(payload)
}
