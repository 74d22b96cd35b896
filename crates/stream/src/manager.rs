//! Actor directory.
//!
//! Maps stream keys to their actor handles. Writers that create a stream
//! spawn its actor on first use; every other operation on an unknown key
//! fails fast with `NotFound` without spawning anything. Actors whose stream
//! is gone remove themselves after [`StreamManager::retire_idle`], so the
//! directory only holds keys that are live or were touched recently.

use std::{
    collections::HashMap,
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info};

use crate::{
    actor::{Command, Directory, Retired, Retirement, StreamActor, StreamHandle},
    error::ApiError,
    types::{
        AppendOutcome, CreateOptions, CreateOutcome, ReadFrom, ReadResult, StreamKey, StreamMeta,
    },
};

/// Default mailbox depth of each stream actor.
pub const DEFAULT_MAILBOX: usize = 256;

/// Default idle time before an actor without a live stream retires.
pub const DEFAULT_RETIRE_IDLE: Duration = Duration::from_secs(1);

/// Upper bounds applied to every read.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_records: 1000,
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Routes stream operations to the owning actor.
pub struct StreamManager {
    actors: Arc<Directory>,
    /// Lowest epoch a freshly spawned actor may use.
    epoch_floor: Arc<AtomicU64>,
    mailbox: usize,
    limits: ReadLimits,
    retire_idle: Duration,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX, ReadLimits::default())
    }
}

impl StreamManager {
    pub fn new(mailbox: usize, limits: ReadLimits) -> Self {
        Self {
            actors: Arc::new(RwLock::new(HashMap::new())),
            epoch_floor: Arc::new(AtomicU64::new(0)),
            mailbox,
            limits,
            retire_idle: DEFAULT_RETIRE_IDLE,
        }
    }

    pub fn with_retire_idle(mut self, idle: Duration) -> Self {
        self.retire_idle = idle;
        self
    }

    pub fn limits(&self) -> ReadLimits {
        self.limits
    }

    pub fn retire_idle(&self) -> Duration {
        self.retire_idle
    }

    /// Get the actor for `key`, spawning it if needed.
    pub fn get_or_spawn(&self, key: &StreamKey) -> StreamHandle {
        // Fast path: read lock
        {
            let actors = self.actors.read();
            if let Some(handle) = actors.get(key)
                && !handle.is_closed()
            {
                return handle.clone();
            }
        }

        // Slow path: write lock
        let mut actors = self.actors.write();
        if let Some(handle) = actors.get(key)
            && !handle.is_closed()
        {
            return handle.clone();
        }

        let handle = StreamActor::spawn_retiring(
            key.clone(),
            self.mailbox,
            Retirement {
                directory: Arc::downgrade(&self.actors),
                epoch_floor: self.epoch_floor.clone(),
                idle: self.retire_idle,
            },
        );
        debug!(stream = %key, "Spawned stream actor");
        actors.insert(key.clone(), handle.clone());
        handle
    }

    /// Handle of an existing actor.
    pub fn existing(&self, key: &StreamKey) -> Result<StreamHandle, ApiError> {
        self.actors
            .read()
            .get(key)
            .filter(|handle| !handle.is_closed())
            .cloned()
            .ok_or_else(|| ApiError::not_found(key.to_string()))
    }

    /// Run one command against the actor of `key`.
    ///
    /// A handle looked up just before its actor retired answers [`Retired`];
    /// the lookup is repeated, which either finds a fresh actor or none.
    async fn dispatch<T>(
        &self,
        key: &StreamKey,
        spawn: bool,
        build: impl Fn(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ApiError> {
        for _ in 0..3 {
            let handle = if spawn {
                self.get_or_spawn(key)
            } else {
                self.existing(key)?
            };
            match handle.call(&build).await {
                Ok(value) => return Ok(value),
                Err(Retired) => debug!(stream = %key, "Stream actor retired mid-request"),
            }
        }
        Err(ApiError::internal(format!("stream actor for {key} keeps retiring")))
    }

    pub async fn create(
        &self,
        key: &StreamKey,
        options: CreateOptions,
    ) -> Result<CreateOutcome, ApiError> {
        self.dispatch(key, true, |reply| Command::Create {
            options: options.clone(),
            reply,
        })
        .await?
    }

    pub async fn append(
        &self,
        key: &StreamKey,
        data: Bytes,
        content_type: Option<String>,
        seq: Option<String>,
    ) -> Result<AppendOutcome, ApiError> {
        self.dispatch(key, false, |reply| Command::Append {
            data: data.clone(),
            content_type: content_type.clone(),
            seq: seq.clone(),
            reply,
        })
        .await?
    }

    /// Catch-up read: returns whatever is available right now.
    pub async fn read(
        &self,
        key: &StreamKey,
        from: ReadFrom,
        limit: Option<usize>,
    ) -> Result<ReadResult, ApiError> {
        let max_records = limit
            .unwrap_or(self.limits.max_records)
            .clamp(1, self.limits.max_records);
        self.dispatch(key, false, |reply| Command::Read {
            from,
            max_records,
            max_bytes: self.limits.max_bytes,
            reply,
        })
        .await?
    }

    /// Read, waiting up to `wait` for records past `from` if caught up.
    ///
    /// Returns `Ok(None)` when the wait elapses with nothing new.
    pub async fn long_poll(
        &self,
        key: &StreamKey,
        from: ReadFrom,
        limit: Option<usize>,
        wait: Duration,
    ) -> Result<Option<ReadResult>, ApiError> {
        let handle = self.existing(key)?;
        let mut tail = handle.watch_tail();

        let first = self.read(key, from, limit).await?;
        if !first.records.is_empty() {
            return Ok(Some(first));
        }

        let position = first.next_offset;
        // Only the liveness flag leaves the closure; the watch guard must not
        // outlive it.
        let woke = timeout(
            wait,
            tail.wait_for(|state| !state.live || state.tail > position),
        )
        .await
        .map(|changed| changed.map(|state| state.live));

        match woke {
            Err(_) => Ok(None),
            Ok(Err(_)) | Ok(Ok(false)) => Err(ApiError::not_found(key.to_string())),
            Ok(Ok(true)) => {
                let result = self.read(key, ReadFrom::At(position), limit).await?;
                Ok((!result.records.is_empty()).then_some(result))
            }
        }
    }

    pub async fn meta(&self, key: &StreamKey) -> Result<StreamMeta, ApiError> {
        self.dispatch(key, false, |reply| Command::Meta { reply })
            .await?
    }

    pub async fn delete(&self, key: &StreamKey) -> Result<(), ApiError> {
        let existed = match self
            .dispatch(key, false, |reply| Command::Delete { reply })
            .await
        {
            Ok(existed) => existed,
            Err(ApiError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !existed {
            return Err(ApiError::not_found(key.to_string()));
        }
        info!(stream = %key, "Deleted stream");
        Ok(())
    }

    /// Number of stream keys with a running actor.
    pub fn actor_count(&self) -> usize {
        self.actors
            .read()
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use durastream_types::Offset;

    use super::*;

    fn key() -> StreamKey {
        StreamKey::new("acme", "orders")
    }

    #[tokio::test]
    async fn test_unknown_key_does_not_spawn() {
        let manager = StreamManager::default();
        assert!(matches!(
            manager.read(&key(), ReadFrom::Start, None).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            manager
                .append(&key(), Bytes::from_static(b"x"), None, None)
                .await,
            Err(ApiError::NotFound(_))
        ));
        assert_eq!(manager.actor_count(), 0);
    }

    #[tokio::test]
    async fn test_same_key_same_actor() {
        let manager = StreamManager::default();
        manager.create(&key(), CreateOptions::default()).await.unwrap();
        manager
            .append(&key(), Bytes::from_static(b"a"), None, None)
            .await
            .unwrap();
        manager.create(&StreamKey::new("other", "orders"), CreateOptions::default())
            .await
            .unwrap();

        let result = manager.read(&key(), ReadFrom::Start, None).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(manager.actor_count(), 2);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let manager = StreamManager::new(
            8,
            ReadLimits {
                max_records: 2,
                ..Default::default()
            },
        );
        manager.create(&key(), CreateOptions::default()).await.unwrap();
        for _ in 0..3 {
            manager
                .append(&key(), Bytes::from_static(b"a"), None, None)
                .await
                .unwrap();
        }
        let result = manager.read(&key(), ReadFrom::Start, Some(50)).await.unwrap();
        assert_eq!(result.records.len(), 2);
        let result = manager.read(&key(), ReadFrom::Start, Some(0)).await.unwrap();
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let manager = StreamManager::default();
        manager.create(&key(), CreateOptions::default()).await.unwrap();
        let result = manager
            .long_poll(&key(), ReadFrom::Start, None, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_append() {
        let manager = std::sync::Arc::new(StreamManager::default());
        manager.create(&key(), CreateOptions::default()).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .long_poll(&key(), ReadFrom::Start, None, Duration::from_secs(10))
                    .await
            })
        };
        tokio::task::yield_now().await;
        manager
            .append(&key(), Bytes::from_static(b"hello"), None, None)
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(&result.records[0].data[..], b"hello");
        assert_eq!(result.next_offset, Offset::new(0, 1));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let manager = StreamManager::default();
        assert!(manager.delete(&key()).await.is_err());
        manager.create(&key(), CreateOptions::default()).await.unwrap();
        assert!(manager.delete(&key()).await.is_ok());
        assert!(manager.delete(&key()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_actors_retire_without_reusing_epochs() {
        let manager = StreamManager::default();
        let short = CreateOptions {
            ttl_seconds: Some(1),
            ..Default::default()
        };
        for i in 0..100 {
            manager
                .create(&StreamKey::new("acme", format!("s{i}")), short.clone())
                .await
                .unwrap();
        }
        manager.create(&key(), short.clone()).await.unwrap();
        assert_eq!(manager.actor_count(), 101);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        manager.create(&key(), short).await.unwrap();
        assert_eq!(manager.meta(&key()).await.unwrap().tail, Offset::new(1, 0));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.actor_count(), 0);
        assert!(matches!(
            manager.read(&key(), ReadFrom::Start, None).await,
            Err(ApiError::NotFound(_))
        ));

        manager.create(&key(), CreateOptions::default()).await.unwrap();
        assert_eq!(manager.actor_count(), 1);
        assert_eq!(manager.meta(&key()).await.unwrap().tail, Offset::new(2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_streams_never_retire() {
        let manager = StreamManager::default().with_retire_idle(Duration::from_millis(10));
        manager.create(&key(), CreateOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.actor_count(), 1);

        manager.delete(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.actor_count(), 0);
        assert!(manager.delete(&key()).await.is_err());
    }
}
