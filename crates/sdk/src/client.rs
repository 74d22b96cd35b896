use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use durastream_types::{DeliveryMode, Offset, START_SENTINEL, SessionInfo, headers};
use reqwest::{RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{ClientError, Result},
    types::{Appended, Batch, ClientConfig, CreateStream, Credentials, StreamInfo},
};

/// HTTP client for one durable streams server.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```ignore
/// use durastream_sdk::{ClientConfig, CreateStream, StreamClient};
///
/// let client = StreamClient::new(ClientConfig::new("http://localhost:4437"));
/// client.create("orders", CreateStream::content_type("application/json")).await?;
/// client.append("orders", r#"{"id":1}"#).await?;
///
/// let batch = client.read("orders", None).await?;
/// let orders: Vec<serde_json::Value> = batch.json()?;
/// ```
#[derive(Clone)]
pub struct StreamClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_http(config, reqwest::Client::new())
    }

    /// Share an existing reqwest client.
    pub fn with_http(config: ClientConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.credentials {
            Credentials::None => request,
            Credentials::Token(token) => request.bearer_auth(token),
            Credentials::ReaderKey { project, key } => request
                .header(headers::STREAM_READER_KEY, key)
                .header(headers::STREAM_PROJECT, project),
        }
    }

    /// Create a stream. Returns `true` when it did not exist before.
    pub async fn create(&self, stream: &str, options: CreateStream) -> Result<bool> {
        let mut request = self.authorized(self.http.put(self.url(&format!("stream/{stream}"))));
        if let Some(content_type) = &options.content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(ttl) = options.ttl_seconds {
            request = request.header(headers::STREAM_TTL, ttl.to_string());
        }
        if let Some(expires_at) = options.expires_at {
            request = request.header(headers::STREAM_EXPIRES_AT, expires_at.to_rfc3339());
        }
        if let Some(data) = options.initial_data {
            request = request.body(data);
        }

        let response = check(request.send().await?).await?;
        let created = response.status() == StatusCode::CREATED;
        debug!(stream, created, "Stream ensured");
        Ok(created)
    }

    /// Append one record using the stream's own content type.
    pub async fn append(&self, stream: &str, data: impl Into<Bytes>) -> Result<Appended> {
        self.append_with(stream, data, None, None).await
    }

    /// Append with an explicit content type and writer sequence.
    pub async fn append_with(
        &self,
        stream: &str,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
        seq: Option<&str>,
    ) -> Result<Appended> {
        let mut request = self.authorized(self.http.post(self.url(&format!("stream/{stream}"))));
        if let Some(content_type) = content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(seq) = seq {
            request = request.header(headers::STREAM_SEQ, seq);
        }

        let response = check(request.body(data.into()).send().await?).await?;
        Ok(Appended {
            offset: header_offset(&response, headers::STREAM_OFFSET)?,
            next_offset: header_offset(&response, headers::STREAM_NEXT_OFFSET)?,
        })
    }

    /// Catch-up read from `from` (the start of the stream when `None`).
    pub async fn read(&self, stream: &str, from: Option<Offset>) -> Result<Batch> {
        let request = self.read_request(stream, from, None);
        let response = check(request.send().await?).await?;
        batch(response).await
    }

    /// Long-poll read. `None` means the wait elapsed with nothing new.
    pub async fn long_poll(&self, stream: &str, from: Option<Offset>) -> Result<Option<Batch>> {
        let request = self.read_request(stream, from, Some("long-poll"));
        let response = check(request.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        batch(response).await.map(Some)
    }

    pub(crate) fn read_request(
        &self,
        stream: &str,
        from: Option<Offset>,
        live: Option<&str>,
    ) -> RequestBuilder {
        let mut query = vec![("offset", encode_from(from))];
        if let Some(live) = live {
            query.push(("live", live.to_string()));
            if live == "long-poll" {
                query.push((
                    "timeout_ms",
                    self.config.long_poll_timeout.as_millis().to_string(),
                ));
            }
        }
        if let Some(limit) = self.config.limit {
            query.push(("limit", limit.to_string()));
        }
        self.authorized(self.http.get(self.url(&format!("stream/{stream}"))))
            .query(&query)
    }

    /// Stream metadata.
    pub async fn head(&self, stream: &str) -> Result<StreamInfo> {
        let request = self.authorized(self.http.head(self.url(&format!("stream/{stream}"))));
        let response = check(request.send().await?).await?;
        Ok(StreamInfo {
            content_type: header_str(&response, header::CONTENT_TYPE.as_str())
                .unwrap_or_default()
                .to_string(),
            next_offset: header_offset(&response, headers::STREAM_NEXT_OFFSET)?,
            ttl_seconds: header_str(&response, headers::STREAM_TTL).and_then(|v| v.parse().ok()),
            expires_at: header_str(&response, headers::STREAM_EXPIRES_AT)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }

    pub async fn delete(&self, stream: &str) -> Result<()> {
        let request = self.authorized(self.http.delete(self.url(&format!("stream/{stream}"))));
        check(request.send().await?).await?;
        Ok(())
    }

    /// Ensure-append-notify in one call. Fails with the subscriber's status
    /// when a push delivery is rejected, even though the record was written.
    pub async fn publish(
        &self,
        stream: &str,
        content_type: &str,
        data: impl Into<Bytes>,
    ) -> Result<Appended> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Published {
            offset: Offset,
            next_offset: Offset,
        }

        let request = self
            .authorized(self.http.post(self.url(&format!("publish/{stream}"))))
            .header(header::CONTENT_TYPE, content_type)
            .body(data.into());
        let published: Published = check(request.send().await?).await?.json().await?;
        Ok(Appended {
            offset: published.offset,
            next_offset: published.next_offset,
        })
    }

    /// Register a fan-out session.
    pub async fn subscribe(
        &self,
        stream: &str,
        mode: DeliveryMode,
        callback: Option<&str>,
        from: Option<Offset>,
    ) -> Result<SessionInfo> {
        let mut request = self
            .authorized(self.http.post(self.url(&format!("subscribe/{stream}"))))
            .header(headers::FANOUT_MODE, mode.as_str())
            .query(&[("offset", encode_from(from))]);
        if let Some(callback) = callback {
            request = request.header(headers::FANOUT_CALLBACK, callback);
        }
        Ok(check(request.send().await?).await?.json().await?)
    }

    /// Sessions registered on a stream.
    pub async fn sessions(&self, stream: &str) -> Result<Vec<SessionInfo>> {
        #[derive(Deserialize)]
        struct Listing {
            sessions: Vec<SessionInfo>,
        }

        let request = self.authorized(self.http.get(self.url(&format!("subscribe/{stream}"))));
        let listing: Listing = check(request.send().await?).await?.json().await?;
        Ok(listing.sessions)
    }

    /// Read the batch after a session's acknowledged position.
    pub async fn poll_session(&self, session_id: &str) -> Result<Option<Batch>> {
        let mut query = vec![(
            "timeout_ms",
            self.config.long_poll_timeout.as_millis().to_string(),
        )];
        if let Some(limit) = self.config.limit {
            query.push(("limit", limit.to_string()));
        }
        let request = self
            .authorized(self.http.get(self.url(&format!("sessions/{session_id}"))))
            .query(&query);
        let response = check(request.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        batch(response).await.map(Some)
    }

    /// Acknowledge everything before `offset` and renew the session.
    pub async fn ack(&self, session_id: &str, offset: Offset) -> Result<SessionInfo> {
        let request = self
            .authorized(self.http.post(self.url(&format!("sessions/{session_id}/ack"))))
            .header(headers::FANOUT_ACK_OFFSET, offset.to_string());
        Ok(check(request.send().await?).await?.json().await?)
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<()> {
        let request = self.authorized(self.http.delete(self.url(&format!("sessions/{session_id}"))));
        check(request.send().await?).await?;
        Ok(())
    }
}

fn encode_from(from: Option<Offset>) -> String {
    from.map(|o| o.to_string())
        .unwrap_or_else(|| START_SENTINEL.to_string())
}

/// Turn an error status into a [`ClientError::Status`].
pub(crate) async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(ClientError::from_body(status, &body))
}

async fn batch(response: Response) -> Result<Batch> {
    let next_offset = header_offset(&response, headers::STREAM_NEXT_OFFSET)?;
    let up_to_date = header_str(&response, headers::STREAM_UP_TO_DATE) == Some("true");
    let content_type = header_str(&response, header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(Batch {
        content_type,
        body: response.bytes().await?,
        next_offset,
        up_to_date,
    })
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_offset(response: &Response, name: &'static str) -> Result<Offset> {
    let raw = header_str(response, name).ok_or(ClientError::MissingHeader(name))?;
    Ok(Offset::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_endpoint() {
        let client = StreamClient::new(ClientConfig::new("http://localhost:4437/"));
        assert_eq!(
            client.url("stream/orders/eu"),
            "http://localhost:4437/v1/stream/orders/eu"
        );
    }

    #[test]
    fn test_read_request_query() {
        let client = StreamClient::new(ClientConfig::new("http://localhost:4437").with_limit(10));
        let request = client
            .read_request("orders", Some(Offset::new(2, 5)), Some("long-poll"))
            .build()
            .unwrap();
        let query = request.url().query().unwrap();
        assert!(query.contains("offset=2_0000000000000005"));
        assert!(query.contains("live=long-poll"));
        assert!(query.contains("timeout_ms=30000"));
        assert!(query.contains("limit=10"));
    }

    #[test]
    fn test_reader_key_headers() {
        let config = ClientConfig::new("http://localhost:4437").with_reader_key("acme", "k");
        let client = StreamClient::new(config);
        let request = client.read_request("orders", None, None).build().unwrap();
        assert_eq!(request.headers()[headers::STREAM_READER_KEY], "k");
        assert_eq!(request.headers()[headers::STREAM_PROJECT], "acme");
        assert!(request.url().query().unwrap().contains("offset=-1"));
    }
}
