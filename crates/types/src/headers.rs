//! HTTP header names used by the stream protocol.
//!
//! All protocol headers use the `Stream-*` / `Stream-Fanout-*` prefixes.

pub const STREAM_NEXT_OFFSET: &str = "Stream-Next-Offset";
/// Offset assigned to the record written by an append.
pub const STREAM_OFFSET: &str = "Stream-Offset";
pub const STREAM_TTL: &str = "Stream-TTL";
pub const STREAM_EXPIRES_AT: &str = "Stream-Expires-At";
pub const STREAM_WRITE_TIMESTAMP: &str = "Stream-Write-Timestamp";
pub const STREAM_UP_TO_DATE: &str = "Stream-Up-To-Date";
/// Writer coordination sequence; must increase strictly per stream.
pub const STREAM_SEQ: &str = "Stream-Seq";
pub const STREAM_READER_KEY: &str = "Stream-Reader-Key";
pub const STREAM_PROJECT: &str = "Stream-Project";
/// `HIT`, `MISS` or `COLLAPSED`, describing how a read was served.
pub const STREAM_CACHE: &str = "Stream-Cache";

pub const FANOUT_SESSION_ID: &str = "Stream-Fanout-Session-Id";
pub const FANOUT_MODE: &str = "Stream-Fanout-Mode";
pub const FANOUT_CALLBACK: &str = "Stream-Fanout-Callback";
pub const FANOUT_ACK_OFFSET: &str = "Stream-Fanout-Ack-Offset";
pub const FANOUT_DELIVERED: &str = "Stream-Fanout-Delivered";

/// Headers browsers must be allowed to read from responses.
pub const EXPOSED: &[&str] = &[
    STREAM_NEXT_OFFSET,
    STREAM_OFFSET,
    STREAM_WRITE_TIMESTAMP,
    STREAM_UP_TO_DATE,
    STREAM_CACHE,
    FANOUT_SESSION_ID,
    FANOUT_DELIVERED,
    "ETag",
];
