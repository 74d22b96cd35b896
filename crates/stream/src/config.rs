//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    cache::CollapserOptions,
    manager::{DEFAULT_MAILBOX, DEFAULT_RETIRE_IDLE, ReadLimits},
    registry::{DEFAULT_ROTATION_GRACE_SECS, ProjectSeed},
    session::SessionLimits,
    validator::DEFAULT_MAX_APPEND_BYTES,
};

/// Options for the durable streams server. Every field has a default so a
/// manifest only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Long-poll timeout in milliseconds, used when a request names none
    pub long_poll_timeout_ms: u64,
    /// Largest single append in bytes
    pub max_append_bytes: usize,
    /// Records returned by one read at most
    pub max_read_records: usize,
    /// Bytes returned by one read at most (a single larger record is still returned)
    pub max_read_bytes: usize,
    /// Depth of each stream actor's mailbox
    pub mailbox_capacity: usize,
    /// Idle time before the actor of an expired or deleted stream is retired
    pub retire_idle_ms: u64,
    /// Freshness window of cached catch-up reads
    pub read_cache_ttl_ms: u64,
    /// Distinct reads allowed in flight at once
    pub max_inflight_reads: usize,
    /// Entries held by the in-process edge cache
    pub edge_cache_capacity: usize,
    /// Pre-warm the next catch-up read after each append
    pub prewarm: bool,
    pub max_sessions: usize,
    pub max_sessions_per_stream: usize,
    pub max_sessions_per_project: usize,
    /// Idle time before a session is reclaimed
    pub session_ttl_ms: u64,
    /// Upper bound on one push delivery
    pub notify_timeout_ms: u64,
    /// Overlap during which a rotated-out signing key still verifies
    pub key_rotation_grace_secs: u64,
    /// Bearer token accepted on the project admin routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// Projects to register at startup; none means open mode
    pub projects: Vec<ProjectSeed>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let read = ReadLimits::default();
        let cache = CollapserOptions::default();
        let sessions = SessionLimits::default();
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            long_poll_timeout_ms: 30_000,
            max_append_bytes: DEFAULT_MAX_APPEND_BYTES,
            max_read_records: read.max_records,
            max_read_bytes: read.max_bytes,
            mailbox_capacity: DEFAULT_MAILBOX,
            retire_idle_ms: DEFAULT_RETIRE_IDLE.as_millis() as u64,
            read_cache_ttl_ms: cache.freshness.as_millis() as u64,
            max_inflight_reads: cache.max_inflight,
            edge_cache_capacity: 10_000,
            prewarm: cache.prewarm,
            max_sessions: sessions.max_sessions,
            max_sessions_per_stream: sessions.max_per_stream,
            max_sessions_per_project: sessions.max_per_project,
            session_ttl_ms: sessions.ttl.as_millis() as u64,
            notify_timeout_ms: sessions.notify_timeout.as_millis() as u64,
            key_rotation_grace_secs: DEFAULT_ROTATION_GRACE_SECS,
            admin_token: None,
            projects: Vec::new(),
        }
    }
}

impl ServerOptions {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn retire_idle(&self) -> Duration {
        Duration::from_millis(self.retire_idle_ms)
    }

    pub fn read_limits(&self) -> ReadLimits {
        ReadLimits {
            max_records: self.max_read_records.max(1),
            max_bytes: self.max_read_bytes.max(1),
        }
    }

    pub fn collapser_options(&self) -> CollapserOptions {
        CollapserOptions {
            freshness: Duration::from_millis(self.read_cache_ttl_ms),
            max_inflight: self.max_inflight_reads,
            prewarm: self.prewarm,
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: self.max_sessions,
            max_per_stream: self.max_sessions_per_stream,
            max_per_project: self.max_sessions_per_project,
            ttl: Duration::from_millis(self.session_ttl_ms),
            notify_timeout: Duration::from_millis(self.notify_timeout_ms),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
