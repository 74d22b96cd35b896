use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
pub use durastream_types::{DeliveryMode, Offset, SessionInfo};
use serde::de::DeserializeOwned;

/// Connection state of a follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,

    /// Connecting to the server
    Connecting,

    /// Successfully connected
    Connected,

    /// Reconnecting after connection loss
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Credentials presented on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Open-mode server, nothing to present
    None,

    /// Project-signed JWT, sent as `Authorization: Bearer`
    Token(String),

    /// Read-only key bound to one stream of a project
    ReaderKey { project: String, key: String },
}

/// How a [`StreamReader`](crate::StreamReader) follows the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowMode {
    /// Repeated `live=long-poll` reads
    #[default]
    LongPoll,

    /// One `live=sse` event stream
    Sse,
}

/// Configuration for a client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server
    pub endpoint: String,

    /// Credentials sent with each request
    pub credentials: Credentials,

    /// Server-side wait for long-poll reads
    pub long_poll_timeout: Duration,

    /// Maximum records per read (server default when unset)
    pub limit: Option<usize>,

    /// Follow mode for readers
    pub follow: FollowMode,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Delay between reconnection attempts (milliseconds)
    pub reconnect_delay_ms: u64,

    /// Maximum number of reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4437".to_string(),
            credentials: Credentials::None,
            long_poll_timeout: Duration::from_secs(30),
            limit: None,
            follow: FollowMode::default(),
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Authenticate with a project token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Credentials::Token(token.into());
        self
    }

    /// Authenticate with a per-stream reader key
    pub fn with_reader_key(mut self, project: impl Into<String>, key: impl Into<String>) -> Self {
        self.credentials = Credentials::ReaderKey {
            project: project.into(),
            key: key.into(),
        };
        self
    }

    /// Set the long-poll wait
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Cap the number of records per read
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Follow with SSE instead of long-poll
    pub fn with_follow(mut self, follow: FollowMode) -> Self {
        self.follow = follow;
        self
    }

    /// Disable auto-reconnect
    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set reconnect delay
    pub fn with_reconnect_delay(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set max reconnect attempts
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

/// Options for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct CreateStream {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Bytes>,
}

impl CreateStream {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Offset of the appended record
    pub offset: Offset,
    /// Tail after the append
    pub next_offset: Offset,
}

/// Stream metadata from `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub content_type: String,
    pub next_offset: Offset,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub content_type: String,
    pub body: Bytes,
    /// Offset to resume from
    pub next_offset: Offset,
    pub up_to_date: bool,
}

impl Batch {
    /// Decode a JSON stream batch into its documents.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        if self.body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&self.body)
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty() || &self.body[..] == b"[]"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::new("http://streams.internal:4437")
            .with_reader_key("acme", "abc123")
            .with_limit(50)
            .without_reconnect();

        assert_eq!(config.endpoint, "http://streams.internal:4437");
        assert_eq!(
            config.credentials,
            Credentials::ReaderKey {
                project: "acme".into(),
                key: "abc123".into()
            }
        );
        assert_eq!(config.limit, Some(50));
        assert!(!config.auto_reconnect);
        assert_eq!(config.follow, FollowMode::LongPoll);
    }

    #[test]
    fn test_batch_json() {
        let batch = Batch {
            content_type: "application/json".into(),
            body: Bytes::from_static(br#"[{"n":1},{"n":2}]"#),
            next_offset: Offset::new(0, 2),
            up_to_date: true,
        };
        let docs: Vec<serde_json::Value> = batch.json().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["n"], 2);

        let empty = Batch {
            body: Bytes::from_static(b"[]"),
            ..batch
        };
        assert!(empty.is_empty());
    }
}
