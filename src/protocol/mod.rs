//! Protocol module - wire messages and byte-stream framing.
//!
//! - [`Message`] and its versioned kind tags
//! - length-prefixed frames for byte-stream transports
//! - [`FrameBuffer`] for accumulating partial reads

mod frame;
mod frame_buffer;
mod message;

pub use frame::{
    build_frame, decode_message_frame, encode_message_frame, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_SIZE,
};
pub use frame_buffer::FrameBuffer;
pub use message::{kinds, CorrelationId, Message, MessageKind, OperationInvoke, NAMESPACE};
