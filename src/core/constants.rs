//! Wire-format and timing constants.
//!
//! The wire format is fixed by the attached device's protocol and MUST NOT be
//! changed; the timing defaults are overridable through the config structs.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Size of the little-endian length field that prefixes every frame.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Marker byte of the historical loopback wire variant.
///
/// The attached device streams zero bytes while its port is idle; the marker
/// lets a receiver in loopback mode distinguish a real frame start from idle
/// noise. The relay path itself uses the plain 4-byte-length format.
pub const MESSAGE_START_BYTE: u8 = 0xA5;

/// Default sanity bound on a decoded length field.
///
/// A corrupted header must not be allowed to demand an unbounded allocation.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// TIMING
// =============================================================================

/// Default maximum time between two chunks of an incomplete frame.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default quiet period before a freshly opened serial link is trusted.
///
/// The device emits spurious bytes for a short while right after the port
/// opens; the link stays in the draining state until the line has been silent
/// for this long.
pub const DEFAULT_DRAIN_QUIET: Duration = Duration::from_millis(100);

/// Suggested delay before a supervisor re-invokes `listen` after a disconnect.
pub const DEFAULT_RELISTEN_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// ENDPOINT DEFAULTS
// =============================================================================

/// Default TCP port the bridge listens on.
pub const DEFAULT_SOCKET_PORT: u16 = 12000;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 230_400;
