//! Stream actors.
//!
//! Each stream key is owned by exactly one actor task. Commands arrive on a
//! bounded mailbox and are handled one at a time in arrival order, which is
//! what makes appends and tail reads linearizable without any lock around the
//! record log.
//!
//! ```text
//!  handlers ──► StreamHandle ──mpsc──► StreamActor ──watch──► long-poll waiters
//!                    ▲                     │
//!                    └──────oneshot────────┘
//! ```
//!
//! The actor also owns the TTL timer of its live instance. The timer is armed
//! when an instance is created and dropped when the instance expires, is
//! deleted or is replaced; expiry is additionally re-checked before every
//! command so a late timer can never expose expired data.
//!
//! An actor without a live instance retires once it has been idle for the
//! configured delay: it leaves the directory, raises the shared epoch floor
//! past every epoch it handed out, and stops. A key that comes back later
//! gets a fresh actor starting at that floor, so epochs never repeat.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use chrono::Utc;
use durastream_types::Offset;
use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Duration, Instant, sleep_until},
};
use tracing::{debug, info};

use crate::{
    error::ApiError,
    types::{
        AppendOutcome, CreateOptions, CreateOutcome, ReadFrom, ReadResult, Record, StreamKey,
        StreamMeta, normalize_content_type,
    },
};

/// Commands accepted by a stream actor.
pub(crate) enum Command {
    Create {
        options: CreateOptions,
        reply: oneshot::Sender<Result<CreateOutcome, ApiError>>,
    },
    Append {
        data: Bytes,
        content_type: Option<String>,
        seq: Option<String>,
        reply: oneshot::Sender<Result<AppendOutcome, ApiError>>,
    },
    Read {
        from: ReadFrom,
        max_records: usize,
        max_bytes: usize,
        reply: oneshot::Sender<Result<ReadResult, ApiError>>,
    },
    Meta {
        reply: oneshot::Sender<Result<StreamMeta, ApiError>>,
    },
    Delete {
        reply: oneshot::Sender<bool>,
    },
}

/// Actor handles by stream key, shared between the manager and its actors.
pub(crate) type Directory = RwLock<HashMap<StreamKey, StreamHandle>>;

/// The actor stopped before answering; the command had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retired;

/// How a directory-owned actor leaves when it is no longer needed.
pub(crate) struct Retirement {
    pub directory: Weak<Directory>,
    pub epoch_floor: Arc<AtomicU64>,
    pub idle: Duration,
}

/// Tail position broadcast to waiters outside the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailState {
    pub tail: Offset,
    pub live: bool,
}

/// Cloneable address of a stream actor.
#[derive(Clone)]
pub struct StreamHandle {
    key: StreamKey,
    id: u64,
    tx: mpsc::Sender<Command>,
    tail_rx: watch::Receiver<TailState>,
}

impl StreamHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Watch the tail of this stream without occupying the actor.
    pub fn watch_tail(&self) -> watch::Receiver<TailState> {
        self.tail_rx.clone()
    }

    pub fn tail(&self) -> TailState {
        *self.tail_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn create(&self, options: CreateOptions) -> Result<CreateOutcome, ApiError> {
        self.request(|reply| Command::Create { options, reply })
            .await?
    }

    pub async fn append(
        &self,
        data: Bytes,
        content_type: Option<String>,
        seq: Option<String>,
    ) -> Result<AppendOutcome, ApiError> {
        self.request(|reply| Command::Append {
            data,
            content_type,
            seq,
            reply,
        })
        .await?
    }

    pub async fn read(
        &self,
        from: ReadFrom,
        max_records: usize,
        max_bytes: usize,
    ) -> Result<ReadResult, ApiError> {
        self.request(|reply| Command::Read {
            from,
            max_records,
            max_bytes,
            reply,
        })
        .await?
    }

    pub async fn meta(&self) -> Result<StreamMeta, ApiError> {
        self.request(|reply| Command::Meta { reply }).await?
    }

    pub async fn delete(&self) -> Result<bool, ApiError> {
        self.request(|reply| Command::Delete { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ApiError> {
        self.call(build)
            .await
            .map_err(|Retired| ApiError::internal(format!("stream actor for {} stopped", self.key)))
    }

    /// Send one command and wait for its reply.
    pub(crate) async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Retired> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| Retired)?;
        rx.await.map_err(|_| Retired)
    }
}

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(0);

/// One live stream instance.
struct Instance {
    meta: StreamMeta,
    records: Vec<Record>,
    deadline: Option<Instant>,
}

/// Serialized owner of one stream key.
pub struct StreamActor {
    key: StreamKey,
    id: u64,
    /// Epoch the next created instance will use.
    next_epoch: u64,
    instance: Option<Instance>,
    tail_tx: watch::Sender<TailState>,
    retirement: Option<Retirement>,
}

impl StreamActor {
    /// Spawn a standalone actor for `key` and return its handle.
    pub fn spawn(key: StreamKey, mailbox: usize) -> StreamHandle {
        Self::start(key, mailbox, 0, None)
    }

    /// Spawn an actor that retires from `retirement.directory` when idle.
    pub(crate) fn spawn_retiring(
        key: StreamKey,
        mailbox: usize,
        retirement: Retirement,
    ) -> StreamHandle {
        let first_epoch = retirement.epoch_floor.load(Ordering::SeqCst);
        Self::start(key, mailbox, first_epoch, Some(retirement))
    }

    fn start(
        key: StreamKey,
        mailbox: usize,
        first_epoch: u64,
        retirement: Option<Retirement>,
    ) -> StreamHandle {
        let (tx, rx) = mpsc::channel(mailbox.max(1));
        let (tail_tx, tail_rx) = watch::channel(TailState {
            tail: Offset::start_of(first_epoch),
            live: false,
        });

        let id = NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed);
        let actor = StreamActor {
            key: key.clone(),
            id,
            next_epoch: first_epoch,
            instance: None,
            tail_tx,
            retirement,
        };
        tokio::spawn(actor.run(rx));

        StreamHandle {
            key,
            id,
            tx,
            tail_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut idle_since = Instant::now();
        loop {
            let deadline = self.instance.as_ref().and_then(|i| i.deadline);
            let retire_at = match (&self.instance, &self.retirement) {
                (None, Some(retirement)) => Some(idle_since + retirement.idle),
                _ => None,
            };
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        self.expire_if_due();
                        self.handle(command);
                        idle_since = Instant::now();
                    }
                    None => break,
                },
                _ = sleep_until_opt(deadline) => {
                    self.expire("ttl elapsed");
                    idle_since = Instant::now();
                }
                _ = sleep_until_opt(retire_at) => {
                    if self.retire(&mut rx) {
                        break;
                    }
                    idle_since = Instant::now();
                }
            }
        }
        debug!(stream = %self.key, "Stream actor stopped");
    }

    /// Leave the directory unless work is already queued.
    ///
    /// Commands sent through a stale handle after the mailbox closes are
    /// dropped unanswered; their callers see [`Retired`] and look the key up
    /// again.
    fn retire(&self, rx: &mut mpsc::Receiver<Command>) -> bool {
        let Some(retirement) = &self.retirement else {
            return false;
        };
        let Some(directory) = retirement.directory.upgrade() else {
            return true;
        };

        {
            let mut actors = directory.write();
            if !rx.is_empty() {
                return false;
            }
            retirement
                .epoch_floor
                .fetch_max(self.next_epoch, Ordering::SeqCst);
            if actors.get(&self.key).is_some_and(|h| h.id == self.id) {
                actors.remove(&self.key);
            }
            rx.close();
        }

        while rx.try_recv().is_ok() {}
        debug!(stream = %self.key, next_epoch = self.next_epoch, "Stream actor retired");
        true
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Create { options, reply } => {
                let _ = reply.send(self.create(options));
            }
            Command::Append {
                data,
                content_type,
                seq,
                reply,
            } => {
                let _ = reply.send(self.append(data, content_type.as_deref(), seq));
            }
            Command::Read {
                from,
                max_records,
                max_bytes,
                reply,
            } => {
                let _ = reply.send(self.read(from, max_records, max_bytes));
            }
            Command::Meta { reply } => {
                let _ = reply.send(self.live().map(|i| i.meta.clone()));
            }
            Command::Delete { reply } => {
                let existed = self.instance.is_some();
                if existed {
                    self.expire("deleted");
                }
                let _ = reply.send(existed);
            }
        }
    }

    fn create(&mut self, options: CreateOptions) -> Result<CreateOutcome, ApiError> {
        let content_type = options.resolved_content_type();

        if let Some(existing) = &self.instance {
            let meta = &existing.meta;
            if meta.content_type != content_type
                || meta.ttl_seconds != options.ttl_seconds
                || meta.expires_at != options.expires_at
            {
                return Err(ApiError::AlreadyExists(self.key.to_string()));
            }
            return Ok(CreateOutcome::Existing);
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let now = Utc::now();
        let deadline = instance_deadline(&options);
        let mut instance = Instance {
            meta: StreamMeta {
                content_type,
                ttl_seconds: options.ttl_seconds,
                expires_at: options.expires_at,
                created_at: now,
                last_write_at: None,
                tail: Offset::start_of(epoch),
                last_seq: None,
            },
            records: Vec::new(),
            deadline,
        };

        if let Some(data) = options.initial_data.filter(|d| !d.is_empty()) {
            instance.records.push(Record {
                offset: instance.meta.tail,
                data,
                timestamp: now.timestamp_millis(),
            });
            instance.meta.tail = instance.meta.tail.next();
            instance.meta.last_write_at = Some(now);
        }

        info!(
            stream = %self.key,
            epoch,
            ttl_seconds = ?options.ttl_seconds,
            "Created stream"
        );
        let tail = instance.meta.tail;
        self.instance = Some(instance);
        self.publish_tail(tail, true);
        Ok(CreateOutcome::Created)
    }

    fn append(
        &mut self,
        data: Bytes,
        content_type: Option<&str>,
        seq: Option<String>,
    ) -> Result<AppendOutcome, ApiError> {
        let key = self.key.to_string();
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| ApiError::not_found(key.clone()))?;

        if let Some(ct) = content_type
            && normalize_content_type(ct) != instance.meta.content_type
        {
            return Err(ApiError::Conflict(format!(
                "Content-type mismatch: expected {}, got {}",
                instance.meta.content_type, ct
            )));
        }

        if let (Some(s), Some(last)) = (&seq, &instance.meta.last_seq)
            && s.as_str() <= last.as_str()
        {
            return Err(ApiError::Conflict(format!(
                "Sequence {s} <= last sequence {last}"
            )));
        }

        let now = Utc::now();
        let offset = instance.meta.tail;
        instance.records.push(Record {
            offset,
            data,
            timestamp: now.timestamp_millis(),
        });
        instance.meta.tail = offset.next();
        instance.meta.last_write_at = Some(now);
        if seq.is_some() {
            instance.meta.last_seq = seq;
        }

        let next_offset = instance.meta.tail;
        debug!(stream = %key, offset = %next_offset, "Appended to stream");
        self.publish_tail(next_offset, true);

        Ok(AppendOutcome {
            offset,
            next_offset,
            previous_tail: offset,
            written_at: now,
        })
    }

    fn read(
        &self,
        from: ReadFrom,
        max_records: usize,
        max_bytes: usize,
    ) -> Result<ReadResult, ApiError> {
        let instance = self.live()?;
        let tail = instance.meta.tail;

        let start = match from {
            ReadFrom::Start => Offset::start_of(tail.epoch()),
            ReadFrom::At(offset) if !offset.same_epoch(&tail) => {
                return Err(ApiError::NotFound(format!(
                    "Offset {offset} belongs to an expired instance of {}",
                    self.key
                )));
            }
            // Past the tail: treated as caught up at the tail.
            ReadFrom::At(offset) => offset.min(tail),
        };

        let mut records = Vec::new();
        let mut bytes = 0usize;
        for record in instance.records.iter().skip(start.seq() as usize) {
            if records.len() >= max_records.max(1) {
                break;
            }
            if !records.is_empty() && bytes + record.data.len() > max_bytes {
                break;
            }
            bytes += record.data.len();
            records.push(record.clone());
        }

        let next_offset = start.advance(records.len() as u64);
        Ok(ReadResult {
            records,
            next_offset,
            up_to_date: next_offset >= tail,
            content_type: instance.meta.content_type.clone(),
            expires_at: instance.deadline,
        })
    }

    fn live(&self) -> Result<&Instance, ApiError> {
        self.instance
            .as_ref()
            .ok_or_else(|| ApiError::not_found(self.key.to_string()))
    }

    fn expire_if_due(&mut self) {
        let due = self
            .instance
            .as_ref()
            .and_then(|i| i.deadline)
            .is_some_and(|deadline| Instant::now() >= deadline);
        if due {
            self.expire("ttl elapsed");
        }
    }

    fn expire(&mut self, reason: &str) {
        if let Some(instance) = self.instance.take() {
            info!(
                stream = %self.key,
                epoch = instance.meta.epoch(),
                records = instance.records.len(),
                reason,
                "Stream instance expired"
            );
            self.publish_tail(instance.meta.tail, false);
        }
    }

    fn publish_tail(&self, tail: Offset, live: bool) {
        self.tail_tx.send_replace(TailState { tail, live });
    }
}

fn instance_deadline(options: &CreateOptions) -> Option<Instant> {
    if let Some(ttl) = options.ttl_seconds {
        return Some(Instant::now() + Duration::from_secs(ttl));
    }
    options.expires_at.map(|at| {
        let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + remaining
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = usize::MAX;

    fn spawn() -> StreamHandle {
        StreamActor::spawn(StreamKey::new("acme", "orders"), 16)
    }

    fn text() -> CreateOptions {
        CreateOptions {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_idempotent_and_conflicting() {
        let handle = spawn();
        assert_eq!(handle.create(text()).await.unwrap(), CreateOutcome::Created);
        assert_eq!(handle.create(text()).await.unwrap(), CreateOutcome::Existing);

        let json = CreateOptions {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            handle.create(json).await,
            Err(ApiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_offsets_strictly_increase() {
        let handle = spawn();
        handle.create(text()).await.unwrap();

        let mut last = Offset::ZERO;
        for i in 0..5 {
            let outcome = handle
                .append(Bytes::from(format!("m{i}")), None, None)
                .await
                .unwrap();
            assert!(outcome.next_offset > last);
            assert_eq!(outcome.next_offset, outcome.offset.next());
            last = outcome.next_offset;
        }
        assert_eq!(last, Offset::new(0, 5));
    }

    #[tokio::test]
    async fn test_round_trip_from_previous_tail() {
        let handle = spawn();
        handle.create(text()).await.unwrap();
        handle.append(Bytes::from_static(b"first"), None, None).await.unwrap();

        let before = handle.meta().await.unwrap().tail;
        handle.append(Bytes::from_static(b"P"), None, None).await.unwrap();

        let result = handle.read(ReadFrom::At(before), MAX, MAX).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(&result.records[0].data[..], b"P");
        assert_eq!(result.next_offset, before.next());
        assert!(result.up_to_date);
    }

    #[tokio::test]
    async fn test_read_at_tail_is_empty_not_error() {
        let handle = spawn();
        handle.create(text()).await.unwrap();
        handle.append(Bytes::from_static(b"a"), None, None).await.unwrap();

        let tail = handle.tail().tail;
        let result = handle.read(ReadFrom::At(tail), MAX, MAX).await.unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.next_offset, tail);
        assert!(result.up_to_date);

        // Syntactically valid but past the tail.
        let result = handle
            .read(ReadFrom::At(tail.advance(10)), MAX, MAX)
            .await
            .unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.next_offset, tail);
    }

    #[tokio::test]
    async fn test_read_limits() {
        let handle = spawn();
        handle.create(text()).await.unwrap();
        for _ in 0..4 {
            handle.append(Bytes::from_static(b"xxxx"), None, None).await.unwrap();
        }

        let limited = handle.read(ReadFrom::Start, 3, MAX).await.unwrap();
        assert_eq!(limited.records.len(), 3);
        assert!(!limited.up_to_date);

        let by_bytes = handle.read(ReadFrom::Start, MAX, 6).await.unwrap();
        assert_eq!(by_bytes.records.len(), 1);
        assert_eq!(by_bytes.next_offset, Offset::new(0, 1));
    }

    #[tokio::test]
    async fn test_append_to_missing_stream_is_not_found() {
        let handle = spawn();
        assert!(matches!(
            handle.append(Bytes::from_static(b"x"), None, None).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_content_type_and_sequence_conflicts() {
        let handle = spawn();
        handle.create(text()).await.unwrap();

        assert!(matches!(
            handle
                .append(Bytes::from_static(b"x"), Some("application/json".into()), None)
                .await,
            Err(ApiError::Conflict(_))
        ));

        handle
            .append(Bytes::from_static(b"x"), None, Some("2".into()))
            .await
            .unwrap();
        assert!(matches!(
            handle
                .append(Bytes::from_static(b"y"), None, Some("1".into()))
                .await,
            Err(ApiError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_recreate_restarts_sequence() {
        let handle = spawn();
        handle
            .create(CreateOptions {
                ttl_seconds: Some(1),
                ..text()
            })
            .await
            .unwrap();
        handle.append(Bytes::from_static(b"old"), None, None).await.unwrap();
        let old_tail = handle.tail().tail;
        assert!(handle.read(ReadFrom::Start, MAX, MAX).await.is_ok());

        tokio::time::sleep(Duration::from_millis(1400)).await;

        assert!(matches!(
            handle.read(ReadFrom::Start, MAX, MAX).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(!handle.tail().live);

        assert_eq!(handle.create(text()).await.unwrap(), CreateOutcome::Created);
        let fresh = handle.read(ReadFrom::Start, MAX, MAX).await.unwrap();
        assert!(fresh.records.is_empty());
        assert_eq!(fresh.next_offset.seq(), 0);
        assert_eq!(fresh.next_offset.epoch(), 1);

        // Offsets from the dead instance are foreign, not malformed.
        assert!(matches!(
            handle.read(ReadFrom::At(old_tail), MAX, MAX).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_without_traffic() {
        let handle = spawn();
        let mut tail = handle.watch_tail();
        handle
            .create(CreateOptions {
                ttl_seconds: Some(1),
                ..text()
            })
            .await
            .unwrap();
        assert!(tail.borrow_and_update().live);

        let created = Instant::now();
        tail.wait_for(|state| !state.live).await.unwrap();
        assert!(created.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_delete() {
        let handle = spawn();
        assert!(!handle.delete().await.unwrap());
        handle.create(text()).await.unwrap();
        assert!(handle.delete().await.unwrap());
        assert!(handle.meta().await.is_err());
    }
}
