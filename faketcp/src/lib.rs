#![cfg_attr(test, allow(clippy::unwrap_used))]

//! A TCP lookalike for carrying tunneled packets through middleboxes.
//!
//! One long-lived "connection" per peer whose segments parse as ordinary
//! TCP, while the payload bytes are really a stream of encapsulated IP
//! packets. Sans-IO throughout; the capture layer owns sockets and clocks.

pub mod endpoint;
pub mod reorder;
pub mod segment;

pub use endpoint::{
    DEFAULT_MSS, Endpoint, Error, HANDSHAKE_TIMEOUT, RESET_COOLDOWN, Role, State,
};
pub use reorder::ReorderBuffer;
pub use segment::{Segment, WINDOW};
