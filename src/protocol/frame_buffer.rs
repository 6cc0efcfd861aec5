//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` and a two-state machine:
//! - `WaitingForHeader`: need the 4-byte length prefix
//! - `WaitingForPayload`: prefix parsed, need N more bytes
//!
//! # Example
//!
//! ```
//! use portwire::protocol::{build_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let frame = build_frame(b"hello").unwrap();
//!
//! assert!(buffer.push(&frame[..3]).unwrap().is_empty());
//! let frames = buffer.push(&frame[3..]).unwrap();
//! assert_eq!(&frames[0][..], b"hello");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::error::{PortwireError, Result};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frame payloads.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// # Errors
    ///
    /// Returns error if a frame announces more than `max_frame_size` bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < FRAME_HEADER_SIZE {
                        return Ok(None);
                    }

                    let len = self.buffer.get_u32();
                    if len > self.max_frame_size {
                        return Err(PortwireError::Protocol(format!(
                            "Frame size {} exceeds maximum {}",
                            len, self.max_frame_size
                        )));
                    }
                    self.state = State::WaitingForPayload { remaining: len };
                }
                State::WaitingForPayload { remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
