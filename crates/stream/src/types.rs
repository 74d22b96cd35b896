//! Core types for the stream engine.

use std::fmt;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use durastream_types::{DEFAULT_CONTENT_TYPE, Offset, START_SENTINEL};
use serde::Serialize;

use crate::error::ApiError;

/// Tenant-scoped identity of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub project: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(project: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.stream)
    }
}

/// An immutable append unit.
#[derive(Debug, Clone)]
pub struct Record {
    pub offset: Offset,
    pub data: Bytes,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

/// Metadata of a live stream instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMeta {
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_write_at: Option<DateTime<Utc>>,
    /// Position the next append will occupy.
    pub tail: Offset,
    #[serde(skip)]
    pub last_seq: Option<String>,
}

impl StreamMeta {
    pub fn epoch(&self) -> u64 {
        self.tail.epoch()
    }

    pub fn is_json(&self) -> bool {
        is_json_content_type(&self.content_type)
    }
}

/// Configuration for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Bytes>,
}

impl CreateOptions {
    pub fn resolved_content_type(&self) -> String {
        self.content_type
            .as_deref()
            .map(normalize_content_type)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A live, compatible instance was already present.
    Existing,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created)
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Offset assigned to the new record.
    pub offset: Offset,
    /// New tail, i.e. the position after the new record.
    pub next_offset: Offset,
    /// Tail before the append; readers caught up there will ask for it next.
    pub previous_tail: Offset,
    pub written_at: DateTime<Utc>,
}

/// Where a read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// First record of the live instance.
    Start,
    At(Offset),
}

impl ReadFrom {
    /// Parse the `offset` query value. Absent, `-1` and the zero offset all
    /// mean the start of the live instance.
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw {
            None | Some(START_SENTINEL) => Ok(ReadFrom::Start),
            Some("") => Err(ApiError::InvalidRequest(
                "Empty offset parameter".to_string(),
            )),
            Some(raw) => {
                let offset: Offset = raw.parse()?;
                if offset.is_zero() {
                    Ok(ReadFrom::Start)
                } else {
                    Ok(ReadFrom::At(offset))
                }
            }
        }
    }

    /// Canonical text used in fingerprints and ETags.
    pub fn encode(&self) -> String {
        match self {
            ReadFrom::Start => START_SENTINEL.to_string(),
            ReadFrom::At(offset) => offset.to_string(),
        }
    }
}

/// Result of reading from a stream.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub records: Vec<Record>,
    /// Position just past the last returned record, or the request position
    /// when nothing new was available.
    pub next_offset: Offset,
    /// Whether `next_offset` equals the tail.
    pub up_to_date: bool,
    pub content_type: String,
    pub expires_at: Option<tokio::time::Instant>,
}

impl ReadResult {
    /// Render records into a response body.
    ///
    /// JSON streams are returned as an array of the appended documents; other
    /// content types are concatenated.
    pub fn body(&self) -> Bytes {
        format_body(&self.content_type, &self.records)
    }
}

/// Render records for the given stream content type.
pub fn format_body(content_type: &str, records: &[Record]) -> Bytes {
    if is_json_content_type(content_type) {
        let mut out = BytesMut::from(&b"["[..]);
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b",");
            }
            out.extend_from_slice(&record.data);
        }
        out.extend_from_slice(b"]");
        return out.freeze();
    }

    let total = records.iter().map(|r| r.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for record in records {
        out.extend_from_slice(&record.data);
    }
    out.freeze()
}

/// Normalize a content type by stripping charset and parameters.
pub fn normalize_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

pub fn is_json_content_type(content_type: &str) -> bool {
    normalize_content_type(content_type).eq_ignore_ascii_case("application/json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, data: &'static [u8]) -> Record {
        Record {
            offset: Offset::new(0, seq),
            data: Bytes::from_static(data),
            timestamp: 0,
        }
    }

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(
            normalize_content_type("application/json; charset=utf-8"),
            "application/json"
        );
        assert_eq!(normalize_content_type("text/plain"), "text/plain");
    }

    #[test]
    fn test_default_content_type() {
        assert_eq!(
            CreateOptions::default().resolved_content_type(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_read_from_parse() {
        assert_eq!(ReadFrom::parse(None).unwrap(), ReadFrom::Start);
        assert_eq!(ReadFrom::parse(Some("-1")).unwrap(), ReadFrom::Start);
        assert_eq!(
            ReadFrom::parse(Some("0_0000000000000000")).unwrap(),
            ReadFrom::Start
        );
        assert_eq!(
            ReadFrom::parse(Some("1_0000000000000004")).unwrap(),
            ReadFrom::At(Offset::new(1, 4))
        );
        assert!(matches!(
            ReadFrom::parse(Some("bogus")),
            Err(ApiError::InvalidRequest(_))
        ));
        assert!(ReadFrom::parse(Some("")).is_err());
    }

    #[test]
    fn test_json_body_is_array() {
        let body = format_body(
            "application/json",
            &[record(0, b"{\"a\":1}"), record(1, b"{\"b\":2}")],
        );
        assert_eq!(&body[..], b"[{\"a\":1},{\"b\":2}]");
        assert_eq!(&format_body("application/json", &[])[..], b"[]");
    }

    #[test]
    fn test_binary_body_is_concatenated() {
        let body = format_body("text/plain", &[record(0, b"hello "), record(1, b"world")]);
        assert_eq!(&body[..], b"hello world");
    }
}
