//! Serial link lifecycle.
//!
//! [`SerialLink`] owns the physical connection: open, a quiet-period drain
//! phase that absorbs the device's post-open line noise, steady-state relay of
//! parsed inbound bytes as [`LinkEvent::Data`], outbound submission with a
//! FIFO queue across the drain boundary, and error/close propagation.
//!
//! ```text
//! CLOSED -> OPENING -> DRAINING -> OPEN -> (CLOSED | FAILED)
//! ```
//!
//! The link never retries on its own; recovery belongs to whoever owns it
//! (see [`Bridge`](crate::bridge::Bridge)).

mod serial;
mod state;

pub use serial::*;
pub use state::LinkState;
