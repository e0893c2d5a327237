//! Length-prefixed frame reassembly.

use bytes::BytesMut;

use super::{Frame, Framer};
use crate::core::{
    DEFAULT_FRAME_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, FrameError, LENGTH_HEADER_SIZE,
};
use std::time::Duration;

/// Configuration for a [`FrameParser`].
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Maximum time between two chunks of an incomplete frame.
    pub timeout: Duration,

    /// Sanity bound on the decoded length field.
    pub max_frame_size: usize,

    /// Channel name carried in timeout errors, e.g. "serial".
    pub channel: Option<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FRAME_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel: None,
        }
    }
}

impl ParserConfig {
    /// Set the inactivity timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum accepted frame size.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Tag timeout errors with a channel name.
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }
}

/// Reassembles `[len: u32 LE][payload]` frames from an arbitrarily chunked
/// stream.
///
/// The parser alternates between two states: waiting for a complete 4-byte
/// length header (`collecting == false`) and accumulating `remaining` payload
/// bytes (`collecting == true`). Unconsumed bytes are carried in a single
/// [`BytesMut`] arena with a `split_to` read cursor, so a chunk containing
/// many frames, or a frame spanning many chunks, costs no reallocation churn.
///
/// Chunk size is immaterial: feeding one byte at a time yields the same frame
/// sequence as feeding one giant chunk. A length field of zero is legal and
/// yields an empty frame immediately.
pub struct FrameParser {
    buffer: BytesMut,
    /// False while waiting for the length header, true while collecting payload.
    collecting: bool,
    /// Payload bytes still needed to complete the current frame.
    remaining: usize,
    timeout: Duration,
    max_frame_size: usize,
    channel: Option<String>,
}

impl FrameParser {
    /// Create a parser.
    pub fn new(config: ParserConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            collecting: false,
            remaining: 0,
            timeout: config.timeout,
            max_frame_size: config.max_frame_size,
            channel: config.channel,
        }
    }

    /// The configured inactivity timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bytes currently buffered but not yet delivered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Framer for FrameParser {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.collecting {
                if self.buffer.len() < LENGTH_HEADER_SIZE {
                    break;
                }
                let header = self.buffer.split_to(LENGTH_HEADER_SIZE);
                let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                if len > self.max_frame_size {
                    return Err(FrameError::Oversized {
                        len,
                        max: self.max_frame_size,
                    });
                }
                self.remaining = len;
                self.collecting = true;
            }

            if self.buffer.len() < self.remaining {
                break;
            }

            // Complete frame; leftover bytes stay in the arena and count
            // toward the next frame, so back-to-back frames in one chunk all
            // come out of this loop.
            self.collecting = false;
            let payload = self.buffer.split_to(self.remaining).freeze();
            self.remaining = 0;
            frames.push(payload);
        }

        Ok(frames)
    }

    fn flush(&mut self) -> Option<Frame> {
        self.collecting = false;
        self.remaining = 0;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    fn pending(&self) -> bool {
        // Any buffered undelivered byte arms the timeout, including a partial
        // length header; a stream stalled mid-header must not wait silently.
        self.collecting || !self.buffer.is_empty()
    }

    fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}
