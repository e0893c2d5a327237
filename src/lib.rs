//! # wirebridge
//!
//! A serial-to-TCP bridge for debug probes and similar attached devices.
//! One process sits between a single TCP client (typically a debugger
//! front-end) and a serial device, relaying bytes in both directions:
//!
//! ```text
//! TCP client <--socket--> Bridge <--link--> serial device
//!                            |
//!                   framing (pass-through
//!                   or length-prefixed)
//! ```
//!
//! What the layers provide:
//!
//! - **Framing**: reassembly of 4-byte-LE length-prefixed frames out of the
//!   arbitrarily chunked serial stream, with a per-frame inactivity timeout
//!   and an oversized-length sanity bound; or verbatim pass-through
//! - **Link**: serial port lifecycle with a post-open drain phase that
//!   discards line noise, and a FIFO queue for writes submitted before the
//!   link is trusted
//! - **Bridge**: a single-tenant TCP listener and the bidirectional relay,
//!   with exactly one disconnect notification per session
//! - **Diag**: pre-flight checks (port availability, serial open, device
//!   loopback)
//!
//! ## Feature Flags
//!
//! - `serial` (default): real serial-port support via `tokio-serial`
//! - `cli` (default): the `wirebridge` binary
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use wirebridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BridgeError> {
//!     let mut link = SerialLink::new(LinkConfig::default());
//!     let link_events = link
//!         .open(async { open_serial_stream("/dev/ttyUSB0", DEFAULT_BAUD_RATE) })
//!         .await;
//!
//!     let config = BridgeConfig::default().port(DEFAULT_SOCKET_PORT);
//!     let (mut bridge, _events) = Bridge::new(config, link, link_events);
//!     loop {
//!         bridge.listen().await?;
//!         tokio::time::sleep(DEFAULT_RELISTEN_DELAY).await;
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Constants and error types (always included)
pub mod core;

// Stream segmentation
pub mod framing;

// Serial link lifecycle
pub mod link;

// Socket relay
pub mod bridge;

// Pre-flight diagnostics
pub mod diag;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::bridge::{Bridge, BridgeConfig, BridgeEvent, ConnectionState};
    pub use crate::diag::{LoopbackReport, run_loopback, socket_port_available};
    pub use crate::framing::{
        Frame, FrameParser, Framer, FramingMode, ParserConfig, Passthrough, encode_frame,
        encode_marker_frame,
    };
    pub use crate::link::{LinkConfig, LinkEvent, LinkState, SerialLink};

    #[cfg(feature = "serial")]
    pub use crate::link::open_serial_stream;
}

// Re-export commonly used items at crate root
pub use bridge::{Bridge, BridgeConfig, BridgeEvent};
pub use core::{BridgeError, FrameError, LinkError};
pub use framing::{Framer, FramingMode, ParserConfig};
pub use link::{LinkConfig, LinkEvent, SerialLink};
