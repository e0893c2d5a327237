//! Stream segmentation.
//!
//! The serial line delivers an arbitrarily chunked byte stream; this module
//! reconstructs discrete frames out of it. Two wire variants exist because the
//! bridge has operated in both modes:
//!
//! - **Length-prefixed**: `[len0][len1][len2][len3][payload...]`, length
//!   little-endian u32, payload exactly `length` bytes, no terminator.
//!   Implemented by [`FrameParser`].
//! - **Pass-through**: no framing at all; every chunk is forwarded verbatim as
//!   soon as it arrives. Implemented by [`Passthrough`].
//!
//! A framer only delimits byte ranges. It never interprets payload contents,
//! and it knows nothing about sockets or serial hardware; the owning
//! [`SerialLink`](crate::link::SerialLink) drives it and arms the per-frame
//! inactivity timeout whenever [`Framer::pending`] reports buffered bytes.

mod parser;
mod passthrough;

pub use parser::{FrameParser, ParserConfig};
pub use passthrough::Passthrough;

use bytes::Bytes;

use crate::core::{FrameError, LENGTH_HEADER_SIZE, MESSAGE_START_BYTE};

/// A complete frame extracted from the stream: an opaque payload byte range.
pub type Frame = Bytes;

/// Byte-stream segmenter.
///
/// Implementations are fed raw chunks and hand back zero or more complete
/// frames per chunk, strictly in arrival order. A chunk is always fully
/// processed before the next one is accepted.
pub trait Framer: Send {
    /// Feed one chunk. Returns every frame the chunk completed.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError>;

    /// Stream end: hand back whatever is still buffered as a final, possibly
    /// incomplete frame instead of discarding it.
    fn flush(&mut self) -> Option<Frame>;

    /// True while undelivered bytes are buffered, i.e. while the inactivity
    /// timeout should be armed.
    fn pending(&self) -> bool;

    /// Channel name for diagnostics, if one was configured.
    fn channel(&self) -> Option<&str>;
}

/// Which wire variant a link should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Forward every chunk verbatim (the relay default).
    #[default]
    Passthrough,
    /// Reassemble 4-byte-LE length-prefixed frames.
    LengthPrefixed,
}

impl FramingMode {
    /// Build the framer for this mode.
    pub fn framer(self, config: ParserConfig) -> Box<dyn Framer> {
        match self {
            FramingMode::Passthrough => Box::new(Passthrough::new(config.channel)),
            FramingMode::LengthPrefixed => Box::new(FrameParser::new(config)),
        }
    }
}

/// Encode a payload in the plain length-prefixed wire format.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a payload in the historical marker wire format.
///
/// The leading [`MESSAGE_START_BYTE`] lets a receiver on a noisy channel (the
/// device streams zeroes when idle) recognize a real frame start. The length
/// field still counts only the payload. Used by the loopback diagnostic.
pub fn encode_marker_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + LENGTH_HEADER_SIZE + payload.len());
    out.push(MESSAGE_START_BYTE);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
