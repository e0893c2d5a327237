//! Raw pass-through variant.

use bytes::Bytes;

use super::{Frame, Framer};
use crate::core::FrameError;

/// A framer that does not frame.
///
/// Every chunk read from the line is forwarded verbatim, unmodified, the
/// moment it arrives. No buffering, so [`Framer::pending`] never reports true
/// and the automatic inactivity timeout never arms; callers awaiting a
/// response can still arm the one-shot timer explicitly through
/// [`SerialLink::expect_response`](crate::link::SerialLink::expect_response).
pub struct Passthrough {
    channel: Option<String>,
}

impl Passthrough {
    /// Create a pass-through framer.
    pub fn new(channel: Option<String>) -> Self {
        Self { channel }
    }
}

impl Framer for Passthrough {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        Ok(vec![Bytes::copy_from_slice(chunk)])
    }

    fn flush(&mut self) -> Option<Frame> {
        None
    }

    fn pending(&self) -> bool {
        false
    }

    fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}
