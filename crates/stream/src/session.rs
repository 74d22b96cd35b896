//! Subscription sessions.
//!
//! A session is a server-side cursor over one stream. Long-poll sessions are
//! driven by the consumer: poll returns records past the acknowledged offset
//! and an explicit ack moves it forward. Push sessions are driven by writes:
//! after each append the server POSTs new records to the session's callback
//! and a 2xx reply counts as the ack.
//!
//! Every interaction renews a session's liveness deadline. Deadlines live in
//! an [`AlarmScheduler`]; when one fires exactly that session is reclaimed and
//! its capacity returned.
//!
//! A session follows one instance of its stream. Once that instance expires,
//! is deleted or is replaced, the session is closed: eagerly through
//! [`SessionManager::close_stale`], or on its next poll, ack or delivery.
//!
//! Push deliveries to one session are serialized on its lane. A notify that
//! finds a delivery already running waits for it and then delivers whatever
//! is still unacknowledged, so every caller sees the outcome for its records.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use durastream_types::{DeliveryMode, Offset, SessionInfo, headers};
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::{
    sync::Mutex as Lane,
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    bounded::BoundedMap,
    error::ApiError,
    manager::StreamManager,
    scheduler::AlarmScheduler,
    types::{ReadFrom, StreamKey},
};

/// Capacity and timing limits for sessions.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub max_per_stream: usize,
    pub max_per_project: usize,
    /// Idle time after which a session is reclaimed.
    pub ttl: Duration,
    /// Upper bound on one push delivery.
    pub notify_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            max_per_stream: 1_000,
            max_per_project: 5_000,
            ttl: Duration::from_secs(60),
            notify_timeout: Duration::from_secs(5),
        }
    }
}

/// One batch pushed to a subscriber callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub callback: String,
    pub session_id: String,
    pub stream: StreamKey,
    pub content_type: String,
    pub next_offset: Offset,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery failed: {0}")]
    Network(String),
}

/// Transport for push deliveries. Resolves to the subscriber's HTTP status.
pub trait Notifier: Send + Sync {
    fn deliver(&self, delivery: Delivery) -> BoxFuture<'static, Result<u16, NotifyError>>;
}

/// Delivers batches with an HTTP POST.
#[derive(Clone, Default)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Notifier for HttpNotifier {
    fn deliver(&self, delivery: Delivery) -> BoxFuture<'static, Result<u16, NotifyError>> {
        let request = self
            .client
            .post(&delivery.callback)
            .header(reqwest::header::CONTENT_TYPE, delivery.content_type)
            .header(headers::STREAM_NEXT_OFFSET, delivery.next_offset.to_string())
            .header(headers::FANOUT_SESSION_ID, delivery.session_id)
            .header(headers::STREAM_PROJECT, delivery.stream.project)
            .body(delivery.body);

        Box::pin(async move {
            match request.send().await {
                Ok(response) => Ok(response.status().as_u16()),
                Err(e) if e.is_timeout() => Err(NotifyError::Timeout),
                Err(e) => Err(NotifyError::Network(e.to_string())),
            }
        })
    }
}

impl NotifyError {
    fn into_api_error(self) -> ApiError {
        match self {
            NotifyError::Timeout => ApiError::Notify {
                status: 504,
                message: "subscriber did not answer in time".to_string(),
            },
            NotifyError::Network(message) => ApiError::Notify {
                status: 502,
                message,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    key: StreamKey,
    mode: DeliveryMode,
    callback: Option<String>,
    /// Position just past the last acknowledged record.
    last_offset: Offset,
    deadline: Instant,
    /// Held for the whole of a push drain.
    lane: Arc<Lane<()>>,
}

impl Session {
    fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            project: self.key.project.clone(),
            stream: self.key.stream.clone(),
            mode: self.mode,
            last_offset: self.last_offset,
            expires_in_ms: self.deadline.saturating_duration_since(now).as_millis() as u64,
            callback: self.callback.clone(),
        }
    }
}

struct SessionTable {
    sessions: BoundedMap<String, Session>,
    per_stream: HashMap<StreamKey, usize>,
    per_project: HashMap<String, usize>,
}

impl SessionTable {
    fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(&id.to_string())?;
        decrement(&mut self.per_stream, &session.key);
        decrement(&mut self.per_project, &session.key.project);
        Some(session)
    }
}

fn decrement<K: std::hash::Hash + Eq>(counts: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Registration parameters.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub key: StreamKey,
    pub mode: DeliveryMode,
    pub callback: Option<String>,
    pub from: ReadFrom,
}

pub struct SessionManager {
    streams: Arc<StreamManager>,
    table: Mutex<SessionTable>,
    alarms: AlarmScheduler<String>,
    notifier: Arc<dyn Notifier>,
    limits: SessionLimits,
}

impl SessionManager {
    pub fn new(
        streams: Arc<StreamManager>,
        notifier: Arc<dyn Notifier>,
        limits: SessionLimits,
    ) -> Arc<Self> {
        let (alarms, mut due) = AlarmScheduler::start();
        let manager = Arc::new(Self {
            streams,
            table: Mutex::new(SessionTable {
                sessions: BoundedMap::new(limits.max_sessions),
                per_stream: HashMap::new(),
                per_project: HashMap::new(),
            }),
            alarms,
            notifier,
            limits,
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(id) = due.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.expire(&id);
            }
        });
        manager
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.table.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn subscribe(&self, request: Subscribe) -> Result<SessionInfo, ApiError> {
        if request.mode == DeliveryMode::Push {
            let callback = request.callback.as_deref().ok_or_else(|| {
                ApiError::InvalidRequest("push sessions require a callback URL".to_string())
            })?;
            let url = url::Url::parse(callback)
                .map_err(|e| ApiError::InvalidRequest(format!("Invalid callback URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ApiError::InvalidRequest(
                    "callback URL must be http or https".to_string(),
                ));
            }
        }

        let meta = self.streams.meta(&request.key).await?;
        let last_offset = match request.from {
            ReadFrom::Start => Offset::start_of(meta.epoch()),
            ReadFrom::At(offset) if offset.same_epoch(&meta.tail) => offset.min(meta.tail),
            ReadFrom::At(offset) => {
                return Err(ApiError::NotFound(format!(
                    "Offset {offset} belongs to an expired instance of {}",
                    request.key
                )));
            }
        };

        let now = Instant::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            key: request.key,
            mode: request.mode,
            callback: request.callback.filter(|_| request.mode == DeliveryMode::Push),
            last_offset,
            deadline: now + self.limits.ttl,
            lane: Arc::new(Lane::new(())),
        };

        {
            let mut table = self.table.lock();
            if table.sessions.is_full() {
                return Err(ApiError::Exhausted("sessions".to_string()));
            }
            let on_stream = table.per_stream.get(&session.key).copied().unwrap_or(0);
            if on_stream >= self.limits.max_per_stream {
                return Err(ApiError::Exhausted(format!("sessions on {}", session.key)));
            }
            let on_project = table
                .per_project
                .get(&session.key.project)
                .copied()
                .unwrap_or(0);
            if on_project >= self.limits.max_per_project {
                return Err(ApiError::Exhausted(format!(
                    "sessions in project {}",
                    session.key.project
                )));
            }

            table
                .sessions
                .try_insert(session.id.clone(), session.clone())
                .map_err(|_| ApiError::Exhausted("sessions".to_string()))?;
            *table.per_stream.entry(session.key.clone()).or_insert(0) += 1;
            *table
                .per_project
                .entry(session.key.project.clone())
                .or_insert(0) += 1;
        }
        self.alarms.schedule_at(session.id.clone(), session.deadline);

        info!(
            session = %session.id,
            stream = %session.key,
            mode = %session.mode,
            offset = %session.last_offset,
            "Session registered"
        );
        Ok(session.info(now))
    }

    pub fn get(&self, id: &str) -> Result<SessionInfo, ApiError> {
        self.table
            .lock()
            .sessions
            .get(&id.to_string())
            .map(|s| s.info(Instant::now()))
            .ok_or_else(|| ApiError::not_found(format!("session {id}")))
    }

    /// Sessions for discovery, optionally restricted to one stream.
    pub fn list(&self, project: &str, stream: Option<&str>) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions: Vec<_> = self
            .table
            .lock()
            .sessions
            .values()
            .filter(|s| s.key.project == project)
            .filter(|s| stream.is_none_or(|name| s.key.stream == name))
            .map(|s| s.info(now))
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Records past the acknowledged offset, waiting up to `wait`.
    ///
    /// Does not move the session; only [`SessionManager::ack`] does.
    pub async fn poll(
        &self,
        id: &str,
        wait: Duration,
        limit: Option<usize>,
    ) -> Result<(SessionInfo, Option<crate::types::ReadResult>), ApiError> {
        let session = self.renew(id)?;
        let wait = wait.min(self.limits.ttl);
        let result = match self
            .streams
            .long_poll(&session.key, ReadFrom::At(session.last_offset), limit, wait)
            .await
        {
            Err(ApiError::NotFound(message)) => {
                self.close(id, "stream instance ended");
                return Err(ApiError::NotFound(message));
            }
            other => other?,
        };
        let info = self.renew(id)?.info(Instant::now());
        Ok((info, result))
    }

    /// Move the session to `offset` and renew it.
    pub fn ack(&self, id: &str, offset: Offset) -> Result<SessionInfo, ApiError> {
        let session = self.renew(id)?;
        let key = session.key;
        let tail = self.streams.existing(&key).ok().map(|handle| handle.tail());
        let Some(tail) = tail.filter(|tail| tail.live && session.last_offset.same_epoch(&tail.tail))
        else {
            self.close(id, "stream instance ended");
            return Err(ApiError::not_found(key.to_string()));
        };

        if !offset.same_epoch(&tail.tail) {
            return Err(ApiError::NotFound(format!(
                "Offset {offset} belongs to an expired instance of {key}"
            )));
        }
        if offset > tail.tail {
            return Err(ApiError::InvalidRequest(format!(
                "Ack offset {offset} is past the tail {}",
                tail.tail
            )));
        }

        let mut table = self.table.lock();
        let session = table
            .sessions
            .get_mut(&id.to_string())
            .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;
        // Acks never move a session backwards.
        session.last_offset = session.last_offset.max(offset);
        debug!(session = %id, offset = %session.last_offset, "Session acknowledged");
        Ok(session.info(Instant::now()))
    }

    pub fn unsubscribe(&self, id: &str) -> Result<(), ApiError> {
        let removed = self.table.lock().remove(id);
        match removed {
            Some(session) => {
                self.alarms.cancel(&session.id);
                info!(session = %id, stream = %session.key, "Session closed");
                Ok(())
            }
            None => Err(ApiError::not_found(format!("session {id}"))),
        }
    }

    fn renew(&self, id: &str) -> Result<Session, ApiError> {
        let deadline = Instant::now() + self.limits.ttl;
        let session = {
            let mut table = self.table.lock();
            let session = table
                .sessions
                .get_mut(&id.to_string())
                .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;
            session.deadline = deadline;
            session.clone()
        };
        self.alarms.schedule_at(id.to_string(), deadline);
        Ok(session)
    }

    /// Close the sessions of `key` that follow an instance other than the
    /// live one. Returns how many were closed.
    pub fn close_stale(&self, key: &StreamKey) -> usize {
        let live = self
            .streams
            .existing(key)
            .ok()
            .map(|handle| handle.tail())
            .filter(|tail| tail.live)
            .map(|tail| tail.tail);

        let stale: Vec<String> = self
            .table
            .lock()
            .sessions
            .values()
            .filter(|s| &s.key == key)
            .filter(|s| live.is_none_or(|tail| !s.last_offset.same_epoch(&tail)))
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            self.close(id, "stream instance ended");
        }
        stale.len()
    }

    fn close(&self, id: &str, reason: &str) {
        let removed = self.table.lock().remove(id);
        if let Some(session) = removed {
            self.alarms.cancel(&session.id);
            info!(session = %id, stream = %session.key, reason, "Session closed");
        }
    }

    fn expire(&self, id: &str) {
        let mut table = self.table.lock();
        let due = table
            .sessions
            .get(&id.to_string())
            .is_some_and(|s| s.deadline <= Instant::now());
        if due && let Some(session) = table.remove(id) {
            info!(session = %id, stream = %session.key, "Session expired");
        }
    }

    /// Push new records of `key` to its push sessions.
    ///
    /// Returns the first delivery failure, carrying the status the subscriber
    /// answered with (502 when unreachable, 504 on timeout).
    pub async fn notify(&self, key: &StreamKey) -> Result<(), ApiError> {
        let targets: Vec<(String, Arc<Lane<()>>)> = self
            .table
            .lock()
            .sessions
            .values()
            .filter(|s| s.mode == DeliveryMode::Push && &s.key == key)
            .map(|s| (s.id.clone(), s.lane.clone()))
            .collect();

        let outcomes = join_all(targets.iter().map(|(id, lane)| async move {
            let _lane = lane.lock().await;
            self.drain(id).await
        }))
        .await;
        outcomes.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    /// Deliver to one session until it is caught up or a delivery fails.
    async fn drain(&self, id: &str) -> Result<(), ApiError> {
        loop {
            let Some(session) = self.table.lock().sessions.get(&id.to_string()).cloned() else {
                return Ok(());
            };
            let Some(callback) = session.callback.clone() else {
                return Ok(());
            };

            let batch = match self
                .streams
                .read(&session.key, ReadFrom::At(session.last_offset), None)
                .await
            {
                Ok(batch) => batch,
                Err(ApiError::NotFound(_)) => {
                    self.close(id, "stream instance ended");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if batch.records.is_empty() {
                return Ok(());
            }

            let delivery = Delivery {
                callback,
                session_id: session.id.clone(),
                stream: session.key.clone(),
                content_type: batch.content_type.clone(),
                next_offset: batch.next_offset,
                body: batch.body(),
            };

            let delivered = timeout(self.limits.notify_timeout, self.notifier.deliver(delivery)).await;
            let status = match delivered {
                Err(_) => Err(NotifyError::Timeout),
                Ok(outcome) => outcome,
            }
            .map_err(|e| {
                warn!(session = %id, error = %e, "Push delivery failed");
                e.into_api_error()
            })?;

            if !(200..300).contains(&status) {
                warn!(session = %id, status, "Subscriber rejected push delivery");
                return Err(ApiError::Notify {
                    status,
                    message: format!("subscriber answered {status}"),
                });
            }

            let deadline = Instant::now() + self.limits.ttl;
            {
                let mut table = self.table.lock();
                let Some(live) = table.sessions.get_mut(&id.to_string()) else {
                    return Ok(());
                };
                live.last_offset = live.last_offset.max(batch.next_offset);
                live.deadline = deadline;
            }
            self.alarms.schedule_at(id.to_string(), deadline);

            debug!(
                session = %id,
                offset = %batch.next_offset,
                records = batch.records.len(),
                "Push delivery acknowledged"
            );
        }
    }
}
