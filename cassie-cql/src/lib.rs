//! Wire-level building blocks of the Cassandra native protocol.
//!
//! This crate knows how to turn requests into frames and frames back into
//! typed responses. It holds no sockets and spawns no tasks; the `cassie`
//! crate builds connections, pools and the control connection on top of it.

pub mod errors;
pub mod frame;

pub use crate::frame::types::Consistency;
pub use crate::frame::{Compression, ProtocolVersion};
