//! Shared wire types for durastream.
//!
//! Both the server (`durastream`) and the client SDK (`durastream-sdk`) depend
//! on this crate so that offsets, header names and session descriptors are
//! encoded identically on both ends of the wire.

pub mod headers;
pub mod offset;
pub mod session;

pub use offset::{MalformedOffset, Offset, START_SENTINEL};
pub use session::{DeliveryMode, SessionInfo};

/// Content type assigned to streams created without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
