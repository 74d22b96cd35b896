//! Read-collapsing cache front.
//!
//! Every read passes through three layers before it may touch a stream actor:
//!
//! 1. the edge cache, keyed by the request fingerprint;
//! 2. the in-flight table, where identical concurrent reads attach to one
//!    shared backend call;
//! 3. the backend call itself, run as a detached task so that a disconnecting
//!    first caller cannot cancel the read for everyone attached to it.
//!
//! Writes take a stamp from a shared write clock and record it as the
//! stream's last write before invalidating the stream's tag. A backend call
//! remembers the clock value it started at and only primes the edge cache if
//! its stream has not been written since, so data loaded before a write is
//! never cached after it. Stamps older than every in-flight read are pruned
//! on each write.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    bounded::BoundedMap,
    error::ApiError,
    manager::StreamManager,
    types::{AppendOutcome, ReadFrom, ReadResult, StreamKey},
};

/// Default freshness window of a primed catch-up read.
pub const DEFAULT_READ_CACHE_TTL: Duration = Duration::from_millis(1000);

/// Live mode of a read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveMode {
    CatchUp,
    LongPoll,
}

impl LiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveMode::CatchUp => "catch-up",
            LiveMode::LongPoll => "long-poll",
        }
    }
}

/// A read as seen by the cache front.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub key: StreamKey,
    pub from: ReadFrom,
    pub live: LiveMode,
    pub timeout: Duration,
    pub limit: Option<usize>,
}

impl ReadRequest {
    pub fn catch_up(key: StreamKey, from: ReadFrom) -> Self {
        Self {
            key,
            from,
            live: LiveMode::CatchUp,
            timeout: Duration::ZERO,
            limit: None,
        }
    }

    pub fn fingerprint(&self) -> ReadFingerprint {
        ReadFingerprint {
            project: self.key.project.clone(),
            stream: self.key.stream.clone(),
            offset: self.from.encode(),
            live: self.live,
            // The wait only shapes long-polls.
            timeout_ms: match self.live {
                LiveMode::CatchUp => None,
                LiveMode::LongPoll => Some(self.timeout.as_millis() as u64),
            },
            limit: self.limit,
        }
    }
}

/// Everything that distinguishes one read response from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadFingerprint {
    pub project: String,
    pub stream: String,
    pub offset: String,
    pub live: LiveMode,
    pub timeout_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl ReadFingerprint {
    /// Cache key: hex SHA-256 over the canonical rendering.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Tag shared by every response of one stream.
    pub fn tag(&self) -> String {
        stream_tag(&self.project, &self.stream)
    }
}

impl fmt::Display for ReadFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.project,
            self.stream,
            self.offset,
            self.live.as_str(),
            self.timeout_ms.map(|t| t.to_string()).unwrap_or_default(),
            self.limit.map(|l| l.to_string()).unwrap_or_default(),
        )
    }
}

pub fn stream_tag(project: &str, stream: &str) -> String {
    format!("{project}/{stream}")
}

/// How a read was served; reported in the `Stream-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Collapsed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Collapsed => "COLLAPSED",
        }
    }
}

/// Response cache sitting in front of the service.
pub trait EdgeCache: Send + Sync {
    fn get(&self, key: &str) -> Option<ReadResult>;

    fn put(&self, key: String, tag: String, value: ReadResult, ttl: Duration);

    /// Drop every entry carrying `tag`.
    fn invalidate(&self, tag: &str);
}

struct EdgeEntry {
    tag: String,
    value: ReadResult,
    expires: Instant,
}

/// In-process [`EdgeCache`] with a fixed entry budget.
///
/// When full, expired entries are dropped first, then the entry closest to
/// expiry.
pub struct MemoryEdgeCache {
    entries: Mutex<HashMap<String, EdgeEntry>>,
    capacity: usize,
}

impl MemoryEdgeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EdgeCache for MemoryEdgeCache {
    fn get(&self, key: &str) -> Option<ReadResult> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, tag: String, value: ReadResult, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, e| e.expires > now);
            if entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    entries.remove(&victim);
                }
            }
        }
        entries.insert(
            key,
            EdgeEntry {
                tag,
                value,
                expires: now + ttl,
            },
        );
    }

    fn invalidate(&self, tag: &str) {
        self.entries.lock().retain(|_, e| e.tag != tag);
    }
}

/// Outcome of a backend call. `None` is a long-poll that timed out.
pub type ReadOutcome = Result<Option<ReadResult>, ApiError>;

type SharedRead = Shared<BoxFuture<'static, ReadOutcome>>;

struct Inflight {
    call_id: u64,
    /// Write clock when the call started.
    started: u64,
    read: SharedRead,
}

/// Tuning for [`ReadCollapser`].
#[derive(Debug, Clone)]
pub struct CollapserOptions {
    pub freshness: Duration,
    pub max_inflight: usize,
    pub prewarm: bool,
}

impl Default for CollapserOptions {
    fn default() -> Self {
        Self {
            freshness: DEFAULT_READ_CACHE_TTL,
            max_inflight: 10_000,
            prewarm: true,
        }
    }
}

/// The cache front. Cheap to clone.
#[derive(Clone)]
pub struct ReadCollapser {
    manager: Arc<StreamManager>,
    edge: Arc<dyn EdgeCache>,
    inflight: Arc<Mutex<BoundedMap<String, Inflight>>>,
    /// Stamp of the last write per stream tag.
    last_write: Arc<Mutex<HashMap<String, u64>>>,
    write_clock: Arc<AtomicU64>,
    next_call: Arc<AtomicU64>,
    backend_calls: Arc<AtomicU64>,
    options: CollapserOptions,
}

impl ReadCollapser {
    pub fn new(
        manager: Arc<StreamManager>,
        edge: Arc<dyn EdgeCache>,
        options: CollapserOptions,
    ) -> Self {
        Self {
            manager,
            edge,
            inflight: Arc::new(Mutex::new(BoundedMap::new(options.max_inflight))),
            last_write: Arc::new(Mutex::new(HashMap::new())),
            write_clock: Arc::new(AtomicU64::new(0)),
            next_call: Arc::new(AtomicU64::new(0)),
            backend_calls: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    /// Number of reads that reached a stream actor.
    pub fn backend_calls(&self) -> u64 {
        self.backend_calls.load(Ordering::Relaxed)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub async fn read(
        &self,
        request: ReadRequest,
    ) -> Result<(Option<ReadResult>, CacheStatus), ApiError> {
        let fingerprint = request.fingerprint();
        let cache_key = fingerprint.cache_key();
        let cacheable = request.live == LiveMode::CatchUp;

        if cacheable && let Some(hit) = self.edge.get(&cache_key) {
            return Ok((Some(hit), CacheStatus::Hit));
        }

        let (read, status) = {
            let mut inflight = self.inflight.lock();
            let tag = fingerprint.tag();
            let last_write = self.last_write_of(&tag);

            match inflight.get(&cache_key) {
                Some(entry) if last_write <= entry.started => {
                    (entry.read.clone(), CacheStatus::Collapsed)
                }
                _ => {
                    // A call that finished between the edge check and taking
                    // the lock has already primed the cache.
                    if cacheable && let Some(hit) = self.edge.get(&cache_key) {
                        return Ok((Some(hit), CacheStatus::Hit));
                    }

                    if !inflight.contains_key(&cache_key) && inflight.is_full() {
                        warn!(capacity = inflight.capacity(), "In-flight read table full");
                        return Err(ApiError::Exhausted("in-flight reads".to_string()));
                    }

                    let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
                    let started = self.write_clock.load(Ordering::SeqCst);
                    let read =
                        self.spawn_backend(request, cache_key.clone(), tag, call_id, started);
                    inflight
                        .try_insert(
                            cache_key.clone(),
                            Inflight {
                                call_id,
                                started,
                                read: read.clone(),
                            },
                        )
                        .map_err(|_| ApiError::Exhausted("in-flight reads".to_string()))?;
                    (read, CacheStatus::Miss)
                }
            }
        };

        if status == CacheStatus::Collapsed {
            debug!(key = %cache_key, "Attached to in-flight read");
        }
        read.await.map(|result| (result, status))
    }

    fn spawn_backend(
        &self,
        request: ReadRequest,
        cache_key: String,
        tag: String,
        call_id: u64,
        started: u64,
    ) -> SharedRead {
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.backend_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = match request.live {
                LiveMode::CatchUp => this
                    .manager
                    .read(&request.key, request.from, request.limit)
                    .await
                    .map(Some),
                LiveMode::LongPoll => {
                    this.manager
                        .long_poll(&request.key, request.from, request.limit, request.timeout)
                        .await
                }
            };

            // A call replaced by a newer one started before a write and must
            // not prime; only the registered call does, while still counted
            // as in flight.
            let mut inflight = this.inflight.lock();
            if inflight
                .get(&cache_key)
                .is_some_and(|entry| entry.call_id == call_id)
            {
                if request.live == LiveMode::CatchUp
                    && let Ok(Some(result)) = &outcome
                {
                    this.prime(&cache_key, &tag, started, result);
                }
                inflight.remove(&cache_key);
            }
            drop(inflight);
            outcome
        });

        async move {
            task.await
                .map_err(|e| ApiError::internal(format!("backend read task failed: {e}")))?
        }
        .boxed()
        .shared()
    }

    fn prime(&self, cache_key: &str, tag: &str, started: u64, result: &ReadResult) {
        let mut ttl = self.options.freshness;
        if let Some(expires_at) = result.expires_at {
            ttl = ttl.min(expires_at.saturating_duration_since(Instant::now()));
        }
        if ttl.is_zero() {
            return;
        }

        // Held across the put so a concurrent write cannot slip between the
        // check and the insert.
        let last_write = self.last_write.lock();
        if last_write.get(tag).copied().unwrap_or(0) > started {
            debug!(tag, "Skipping stale cache prime");
            return;
        }
        self.edge
            .put(cache_key.to_string(), tag.to_string(), result.clone(), ttl);
    }

    fn last_write_of(&self, tag: &str) -> u64 {
        self.last_write.lock().get(tag).copied().unwrap_or(0)
    }

    fn bump(&self, key: &StreamKey) {
        let tag = stream_tag(&key.project, &key.stream);
        // Reads register under the in-flight lock, so none can start between
        // reading the oldest start and taking the stamp.
        let inflight = self.inflight.lock();
        let oldest = inflight.values().map(|entry| entry.started).min();
        let mut last_write = self.last_write.lock();
        let stamp = self.write_clock.fetch_add(1, Ordering::SeqCst) + 1;
        match oldest {
            Some(oldest) => {
                last_write.insert(tag.clone(), stamp);
                last_write.retain(|_, written| *written > oldest);
            }
            None => last_write.clear(),
        }
        drop(inflight);
        self.edge.invalidate(&tag);
    }

    /// Streams whose last write still matters to an in-flight read.
    pub fn tracked_writes(&self) -> usize {
        self.last_write.lock().len()
    }

    /// Invalidate after a write and optionally pre-warm the read that
    /// caught-up readers will issue next.
    pub fn on_append(&self, key: &StreamKey, outcome: &AppendOutcome) {
        self.bump(key);

        if self.options.prewarm {
            let this = self.clone();
            let request = ReadRequest::catch_up(key.clone(), ReadFrom::At(outcome.previous_tail));
            tokio::spawn(async move {
                if let Err(e) = this.read(request).await {
                    debug!(error = %e, "Cache pre-warm failed");
                }
            });
        }
    }

    /// Invalidate after a stream is deleted or recreated.
    pub fn on_reset(&self, key: &StreamKey) {
        self.bump(key);
    }
}
