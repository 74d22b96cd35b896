use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    client::StreamClient,
    error::{ClientError, Result},
    types::{Batch, ConnectionState, FollowMode, Offset},
};

/// Stream reader - follows a stream's tail and broadcasts each batch
///
/// The reader keeps its own position, so a reconnect resumes exactly where
/// the last delivered batch ended. A stream that disappears (deleted or
/// expired) ends the reader instead of triggering reconnects.
///
/// # Example
///
/// ```ignore
/// use durastream_sdk::{ClientConfig, StreamClient, StreamReader};
///
/// let client = StreamClient::new(ClientConfig::new("http://localhost:4437"));
/// let mut reader = StreamReader::new(client, "orders", None);
///
/// let mut rx = reader.subscribe();
/// reader.connect().await?;
///
/// while let Ok(batch) = rx.recv().await {
///     println!("{} bytes, resume at {}", batch.body.len(), batch.next_offset);
/// }
/// ```
pub struct StreamReader {
    client: StreamClient,

    stream: String,

    /// Resume position; `None` is the start of the stream
    position: Arc<RwLock<Option<Offset>>>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Batch broadcaster for distributing batches to multiple subscribers
    batch_tx: broadcast::Sender<Batch>,

    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,

    /// Reconnection attempt counter
    reconnect_attempts: Arc<RwLock<u32>>,
}

impl StreamReader {
    /// Create a reader starting at `from` (the stream start when `None`)
    pub fn new(client: StreamClient, stream: impl Into<String>, from: Option<Offset>) -> Self {
        let (batch_tx, _) = broadcast::channel(256);

        Self {
            client,
            stream: stream.into(),
            position: Arc::new(RwLock::new(from)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            batch_tx,
            shutdown_tx: None,
            reconnect_attempts: Arc::new(RwLock::new(0)),
        }
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Offset the next read will start from
    pub fn position(&self) -> Option<Offset> {
        *self.position.read()
    }

    /// Subscribe to batches from this reader
    pub fn subscribe(&self) -> broadcast::Receiver<Batch> {
        self.batch_tx.subscribe()
    }

    /// Start following the stream
    pub async fn connect(&mut self) -> Result<()> {
        if self.shutdown_tx.is_some() {
            return Ok(());
        }

        *self.state.write() = ConnectionState::Connecting;
        info!(
            stream = %self.stream,
            mode = ?self.client.config().follow,
            "Following stream"
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let follower = Follower {
            client: self.client.clone(),
            stream: self.stream.clone(),
            position: Arc::clone(&self.position),
            state: Arc::clone(&self.state),
            batch_tx: self.batch_tx.clone(),
            reconnect_attempts: Arc::clone(&self.reconnect_attempts),
        };
        tokio::spawn(follower.run(shutdown_rx));

        Ok(())
    }

    /// Stop following
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        *self.state.write() = ConnectionState::Disconnected;
        info!(stream = %self.stream, "Stopped following stream");
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Everything the background task owns.
struct Follower {
    client: StreamClient,
    stream: String,
    position: Arc<RwLock<Option<Offset>>>,
    state: Arc<RwLock<ConnectionState>>,
    batch_tx: broadcast::Sender<Batch>,
    reconnect_attempts: Arc<RwLock<u32>>,
}

/// Why one connection ended.
enum Ended {
    Shutdown,
    Gone,
    Lost,
}

impl Follower {
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let config = self.client.config().clone();
        loop {
            let ended = match config.follow {
                FollowMode::LongPoll => self.long_poll(&mut shutdown_rx).await,
                FollowMode::Sse => self.sse(&mut shutdown_rx).await,
            };

            match ended {
                Ended::Shutdown => return,
                Ended::Gone => {
                    *self.state.write() = ConnectionState::Disconnected;
                    return;
                }
                Ended::Lost => {}
            }

            if !config.auto_reconnect {
                *self.state.write() = ConnectionState::Disconnected;
                return;
            }

            {
                let mut attempts = self.reconnect_attempts.write();
                *attempts += 1;
                if config.max_reconnect_attempts > 0 && *attempts >= config.max_reconnect_attempts
                {
                    error!(
                        stream = %self.stream,
                        attempts = *attempts,
                        "Max reconnection attempts reached"
                    );
                    *self.state.write() = ConnectionState::Disconnected;
                    return;
                }
            }

            *self.state.write() = ConnectionState::Reconnecting;
            info!(
                stream = %self.stream,
                delay_ms = config.reconnect_delay_ms,
                "Scheduling reconnection"
            );

            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(std::time::Duration::from_millis(config.reconnect_delay_ms)) => {}
            }
        }
    }

    fn connected(&self) {
        *self.state.write() = ConnectionState::Connected;
        *self.reconnect_attempts.write() = 0;
    }

    fn deliver(&self, batch: Batch) {
        *self.position.write() = Some(batch.next_offset);
        if !batch.is_empty() {
            debug!(
                stream = %self.stream,
                next_offset = %batch.next_offset,
                bytes = batch.body.len(),
                "Received batch"
            );
            let _ = self.batch_tx.send(batch);
        }
    }

    fn classify(&self, e: &ClientError) -> Ended {
        if e.is_not_found() {
            warn!(stream = %self.stream, "Stream is gone, stopping reader");
            Ended::Gone
        } else {
            error!(stream = %self.stream, error = %e, "Read failed");
            Ended::Lost
        }
    }

    async fn long_poll(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> Ended {
        loop {
            let from = *self.position.read();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(stream = %self.stream, "Shutdown signal received");
                    return Ended::Shutdown;
                }
                result = self.client.long_poll(&self.stream, from) => match result {
                    Ok(Some(batch)) => {
                        self.connected();
                        self.deliver(batch);
                    }
                    Ok(None) => self.connected(),
                    Err(e) => return self.classify(&e),
                }
            }
        }
    }

    async fn sse(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> Ended {
        let content_type = match self.client.head(&self.stream).await {
            Ok(info) => info.content_type,
            Err(e) => return self.classify(&e),
        };
        let from = *self.position.read();
        let request = self.client.read_request(&self.stream, from, Some("sse"));
        let mut es = match EventSource::new(request) {
            Ok(es) => es,
            Err(e) => {
                error!(stream = %self.stream, error = %e, "Cannot open event source");
                return Ended::Gone;
            }
        };

        let mut pending = SseBatch::new(content_type);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(stream = %self.stream, "Shutdown signal received");
                    es.close();
                    return Ended::Shutdown;
                }
                event = es.next() => match event {
                    Some(Ok(SseEvent::Open)) => {
                        debug!(stream = %self.stream, "SSE connection opened");
                        self.connected();
                    }
                    Some(Ok(SseEvent::Message(msg))) => match msg.event.as_str() {
                        "data" => pending.push(msg.data.as_bytes()),
                        "control" => match serde_json::from_str::<Control>(&msg.data) {
                            Ok(control) => self.deliver(pending.finish(control)),
                            Err(e) => warn!(stream = %self.stream, error = %e, "Bad control event"),
                        },
                        "error" => {
                            warn!(stream = %self.stream, data = %msg.data, "Server ended event stream");
                            es.close();
                            return Ended::Gone;
                        }
                        other => debug!(stream = %self.stream, event = other, "Ignoring event"),
                    },
                    Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)))
                        if status == reqwest::StatusCode::NOT_FOUND =>
                    {
                        es.close();
                        warn!(stream = %self.stream, "Stream is gone, stopping reader");
                        return Ended::Gone;
                    }
                    Some(Err(e)) => {
                        error!(stream = %self.stream, error = %e, "SSE error");
                        es.close();
                        return Ended::Lost;
                    }
                    None => {
                        info!(stream = %self.stream, "SSE stream ended");
                        return Ended::Lost;
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Control {
    stream_next_offset: Offset,
    up_to_date: bool,
}

/// Records collected between two control events.
struct SseBatch {
    content_type: String,
    json: bool,
    records: Vec<Bytes>,
}

impl SseBatch {
    fn new(content_type: String) -> Self {
        let json = content_type
            .split(';')
            .next()
            .is_some_and(|base| base.trim().eq_ignore_ascii_case("application/json"));
        Self {
            content_type,
            json,
            records: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.records.push(Bytes::copy_from_slice(data));
    }

    fn finish(&mut self, control: Control) -> Batch {
        let records = std::mem::take(&mut self.records);
        let mut body = BytesMut::new();
        if self.json {
            body.extend_from_slice(b"[");
            for (i, record) in records.iter().enumerate() {
                if i > 0 {
                    body.extend_from_slice(b",");
                }
                body.extend_from_slice(record);
            }
            body.extend_from_slice(b"]");
        } else {
            for record in &records {
                body.extend_from_slice(record);
            }
        }
        Batch {
            content_type: self.content_type.clone(),
            body: body.freeze(),
            next_offset: control.stream_next_offset,
            up_to_date: control.up_to_date,
        }
    }
}

/// Follow a stream with long-polls as an async [`Stream`] of batches.
///
/// Ends after the first error; empty (timed-out) polls are skipped.
pub fn follow(
    client: StreamClient,
    stream: String,
    from: Option<Offset>,
) -> impl Stream<Item = Result<Batch>> {
    async_stream::try_stream! {
        let mut position = from;
        loop {
            if let Some(batch) = client.long_poll(&stream, position).await? {
                position = Some(batch.next_offset);
                if !batch.is_empty() {
                    yield batch;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientConfig;

    #[test]
    fn test_sse_batch_joins_json_records() {
        let mut batch = SseBatch::new("application/json; charset=utf-8".into());
        batch.push(br#"{"a":1}"#);
        batch.push(br#"{"a":2}"#);
        let out = batch.finish(Control {
            stream_next_offset: Offset::new(0, 2),
            up_to_date: true,
        });
        assert_eq!(&out.body[..], br#"[{"a":1},{"a":2}]"#);
        assert_eq!(out.next_offset, Offset::new(0, 2));
        assert!(batch.records.is_empty());
    }

    #[test]
    fn test_sse_batch_concatenates_bytes() {
        let mut batch = SseBatch::new("text/plain".into());
        batch.push(b"ab");
        batch.push(b"cd");
        let out = batch.finish(Control {
            stream_next_offset: Offset::new(1, 2),
            up_to_date: false,
        });
        assert_eq!(&out.body[..], b"abcd");
        assert!(!out.up_to_date);
    }

    #[test]
    fn test_new_reader_is_disconnected() {
        let client = StreamClient::new(ClientConfig::default());
        let reader = StreamReader::new(client, "orders", Some(Offset::new(0, 4)));
        assert_eq!(reader.state(), ConnectionState::Disconnected);
        assert_eq!(reader.position(), Some(Offset::new(0, 4)));
    }
}
