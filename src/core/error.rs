//! Error types for the bridge.
//!
//! One enum per layer. Errors cross task boundaries inside events
//! ([`LinkEvent`](crate::link::LinkEvent), [`BridgeEvent`](crate::bridge::BridgeEvent)),
//! never as panics.

use thiserror::Error;

/// Errors produced while segmenting the byte stream into frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Too much time passed between two chunks of an incomplete frame.
    #[error("frame timeout{}: {cause}", channel_suffix(.channel))]
    Timeout {
        /// Channel name for diagnostics, e.g. "serial".
        channel: Option<String>,
        /// What was being waited for when the timer fired.
        cause: String,
    },

    /// A length header demanded more than the configured maximum frame size.
    ///
    /// A pure length-prefixed stream has no resync point, so the stream is
    /// unusable after this.
    #[error("oversized frame: length field {len} exceeds maximum {max}")]
    Oversized {
        /// The decoded length field.
        len: usize,
        /// The configured bound.
        max: usize,
    },
}

impl FrameError {
    /// Build a timeout error tagged with an optional channel name.
    pub fn timeout(channel: Option<&str>, cause: impl Into<String>) -> Self {
        Self::Timeout {
            channel: channel.map(str::to_owned),
            cause: cause.into(),
        }
    }
}

fn channel_suffix(channel: &Option<String>) -> String {
    match channel {
        Some(name) => format!(" ({name})"),
        None => String::new(),
    }
}

/// Errors on the serial side of the bridge.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The driver failed to open, read, or write.
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failed on the inbound stream.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The device closed the stream while the link was still up.
    #[error("serial stream closed unexpectedly")]
    ClosedByPeer,

    /// An operation was issued against a link with no running session.
    #[error("serial link is not open")]
    NotOpen,
}

/// Errors on the socket side of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Binding, accepting, or relaying failed.
    #[error("socket i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial link rejected an operation.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// A state transition was requested that the lifecycle table forbids.
    ///
    /// This indicates a bug in the caller, not a runtime condition.
    #[error("illegal connection state transition: {from} -> {to}")]
    IllegalTransition {
        /// State before the attempted transition.
        from: &'static str,
        /// Requested target state.
        to: &'static str,
    },
}

/// Errors from the pre-flight diagnostics.
#[derive(Debug, Error)]
pub enum DiagError {
    /// A probe or the loopback stream failed at the driver level.
    #[error("diagnostic i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The loopback stream could not be segmented.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// An echoed payload byte broke the expected sequence.
    #[error("wrong data received after {bytes_received} received bytes")]
    Corrupt {
        /// How many bytes came back correctly before the mismatch.
        bytes_received: u64,
    },

    /// The device never answered within the per-frame window.
    #[error("no data received")]
    NoData,
}
