//! Core constants and error types.
//!
//! Everything in here is shared by the framing, link, and bridge layers.

pub mod constants;
pub mod error;

pub use constants::*;
pub use error::*;
