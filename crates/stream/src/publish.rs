//! Write fan-out.
//!
//! Every successful append is followed by the same two steps: invalidate the
//! read cache for the stream, then hand new records to push sessions. Plain
//! appends run the notify step in the background; publish waits for it and
//! reports the first delivery failure to the caller.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    cache::ReadCollapser,
    error::ApiError,
    manager::StreamManager,
    session::SessionManager,
    types::{AppendOutcome, CreateOptions, StreamKey},
    validator::validate_append_body,
};

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub key: StreamKey,
    pub data: Bytes,
    pub content_type: Option<String>,
    pub seq: Option<String>,
    /// Used when the stream does not exist yet.
    pub create: CreateOptions,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub append: AppendOutcome,
    pub created: bool,
}

#[derive(Clone)]
pub struct Publisher {
    streams: Arc<StreamManager>,
    cache: ReadCollapser,
    sessions: Arc<SessionManager>,
}

impl Publisher {
    pub fn new(
        streams: Arc<StreamManager>,
        cache: ReadCollapser,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            streams,
            cache,
            sessions,
        }
    }

    /// Ensure the stream exists, append, then notify push sessions.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishOutcome, ApiError> {
        let content_type = match self.streams.meta(&request.key).await {
            Ok(meta) => meta.content_type,
            Err(ApiError::NotFound(_)) => request.create.resolved_content_type(),
            Err(e) => return Err(e),
        };
        validate_append_body(&request.data, &content_type)?;

        let created = match self.streams.create(&request.key, request.create).await {
            Ok(outcome) => outcome.is_created(),
            // Live with other settings; publish only needs it to exist.
            Err(ApiError::AlreadyExists(_)) => false,
            Err(e) => return Err(e),
        };
        if created {
            self.after_reset(&request.key);
        }

        let append = self
            .streams
            .append(&request.key, request.data, request.content_type, request.seq)
            .await?;
        self.cache.on_append(&request.key, &append);

        debug!(stream = %request.key, offset = %append.next_offset, created, "Published");
        self.sessions.notify(&request.key).await?;

        Ok(PublishOutcome { append, created })
    }

    /// Follow-up for appends that did not come through [`Publisher::publish`].
    pub fn after_append(&self, key: &StreamKey, outcome: &AppendOutcome) {
        self.cache.on_append(key, outcome);

        let sessions = self.sessions.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = sessions.notify(&key).await {
                warn!(stream = %key, error = %e, "Background push delivery failed");
            }
        });
    }

    /// Follow-up for create and delete. Sessions of the previous instance
    /// are closed.
    pub fn after_reset(&self, key: &StreamKey) {
        self.cache.on_reset(key);
        let closed = self.sessions.close_stale(key);
        if closed > 0 {
            debug!(stream = %key, closed, "Closed sessions of a previous instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use durastream_types::{DeliveryMode, Offset};

    use super::*;
    use crate::{
        cache::{CollapserOptions, MemoryEdgeCache},
        session::{
            Notifier, NotifyError, SessionLimits, Subscribe,
            tests::{GatedNotifier, MockNotifier},
        },
        types::ReadFrom,
    };

    fn key() -> StreamKey {
        StreamKey::new("acme", "events")
    }

    fn publisher(notifier: Arc<dyn Notifier>) -> (Publisher, Arc<SessionManager>) {
        let streams = Arc::new(StreamManager::default());
        let cache = ReadCollapser::new(
            streams.clone(),
            Arc::new(MemoryEdgeCache::new(16)),
            CollapserOptions {
                prewarm: false,
                ..Default::default()
            },
        );
        let sessions = SessionManager::new(streams.clone(), notifier, SessionLimits::default());
        (Publisher::new(streams, cache, sessions.clone()), sessions)
    }

    fn request(data: &'static [u8]) -> PublishRequest {
        PublishRequest {
            key: key(),
            data: Bytes::from_static(data),
            content_type: None,
            seq: None,
            create: CreateOptions {
                content_type: Some("application/json".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_publish_creates_on_first_use() {
        let (publisher, _) = publisher(MockNotifier::answering(Ok(200)));
        let first = publisher.publish(request(b"{\"n\":1}")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.append.offset, Offset::ZERO);

        let second = publisher.publish(request(b"{\"n\":2}")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.append.next_offset, Offset::new(0, 2));
    }

    #[tokio::test]
    async fn test_publish_validates_against_stream_type() {
        let (publisher, _) = publisher(MockNotifier::answering(Ok(200)));
        let err = publisher.publish(request(b"not json")).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
        // Rejected before the stream was created.
        assert!(publisher.streams.meta(&key()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_appends_before_notifying() {
        let notifier = MockNotifier::answering(Ok(200));
        let (publisher, sessions) = publisher(notifier.clone());
        publisher.publish(request(b"{\"n\":1}")).await.unwrap();
        sessions
            .subscribe(Subscribe {
                key: key(),
                mode: DeliveryMode::Push,
                callback: Some("http://hook.test/".to_string()),
                from: ReadFrom::Start,
            })
            .await
            .unwrap();

        publisher.publish(request(b"{\"n\":2}")).await.unwrap();
        let deliveries = notifier.deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        // The delivery already contains the record that triggered it.
        assert_eq!(&deliveries[0].body[..], b"[{\"n\":1},{\"n\":2}]");
        assert_eq!(deliveries[0].next_offset, Offset::new(0, 2));
    }

    #[tokio::test]
    async fn test_publish_surfaces_notify_failure() {
        let notifier = MockNotifier::answering(Err(NotifyError::Timeout));
        let (publisher, sessions) = publisher(notifier);
        publisher.publish(request(b"{\"n\":1}")).await.unwrap();
        sessions
            .subscribe(Subscribe {
                key: key(),
                mode: DeliveryMode::Push,
                callback: Some("http://hook.test/".to_string()),
                from: ReadFrom::Start,
            })
            .await
            .unwrap();

        let err = publisher.publish(request(b"{\"n\":2}")).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    fn push() -> Subscribe {
        Subscribe {
            key: key(),
            mode: DeliveryMode::Push,
            callback: Some("http://hook.test/".to_string()),
            from: ReadFrom::Start,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_after_expiry_closes_old_sessions() {
        let notifier = MockNotifier::answering(Ok(200));
        let (publisher, sessions) = publisher(notifier.clone());
        let short = PublishRequest {
            create: CreateOptions {
                ttl_seconds: Some(1),
                ..request(b"").create
            },
            ..request(b"{\"n\":1}")
        };
        publisher.publish(short.clone()).await.unwrap();
        let session = sessions.subscribe(push()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let again = publisher.publish(short).await.unwrap();
        assert!(again.created);
        assert_eq!(again.append.offset, Offset::new(1, 0));
        assert!(sessions.get(&session.id).is_err());
        assert_eq!(notifier.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_waits_for_background_delivery() {
        let notifier = GatedNotifier::answering(500);
        let (publisher, sessions) = publisher(notifier.clone());
        publisher.publish(request(b"{\"n\":1}")).await.unwrap();
        sessions.subscribe(push()).await.unwrap();

        let outcome = publisher
            .streams
            .append(&key(), Bytes::from_static(b"{\"n\":2}"), None, None)
            .await
            .unwrap();
        publisher.after_append(&key(), &outcome);
        while notifier.calls() == 0 {
            tokio::task::yield_now().await;
        }

        // The background delivery is held at the subscriber.
        let publishing = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish(request(b"{\"n\":3}")).await })
        };
        tokio::task::yield_now().await;
        notifier.release();

        let err = publishing.await.unwrap().unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(notifier.calls(), 2);
    }
}
