//! HTTP server implementing the durable streams protocol.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header, response::Builder},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post, put},
};
use base64::Engine;
use bytes::BytesMut;
use durastream_types::{DeliveryMode, Offset, headers};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info};

use crate::{
    auth::{AuthContext, authenticate, authorize_admin},
    cache::{CacheStatus, LiveMode, MemoryEdgeCache, ReadCollapser, ReadRequest},
    config::ServerOptions,
    error::ApiError,
    manager::StreamManager,
    publish::{PublishRequest, Publisher},
    registry::{DEFAULT_TOKEN_TTL_SECS, ProjectRegistry, Scope},
    session::{HttpNotifier, Notifier, SessionManager, Subscribe},
    types::{CreateOptions, ReadFrom, ReadResult, Record, StreamKey},
    validator::{
        validate_append_body, validate_body_size, validate_content_length, validate_stream_id,
        validate_ttl_headers,
    },
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub streams: Arc<StreamManager>,
    pub cache: ReadCollapser,
    pub sessions: Arc<SessionManager>,
    pub publisher: Publisher,
    pub registry: Arc<ProjectRegistry>,
    pub options: Arc<ServerOptions>,
}

impl AppState {
    pub fn new(options: ServerOptions) -> Result<Self, ApiError> {
        Self::with_notifier(options, Arc::new(HttpNotifier::default()))
    }

    /// State with a custom push transport.
    pub fn with_notifier(
        options: ServerOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ApiError> {
        let registry = Arc::new(ProjectRegistry::from_seeds(
            &options.projects,
            options.key_rotation_grace_secs,
        )?);
        let streams = Arc::new(
            StreamManager::new(options.mailbox_capacity, options.read_limits())
                .with_retire_idle(options.retire_idle()),
        );
        let cache = ReadCollapser::new(
            streams.clone(),
            Arc::new(MemoryEdgeCache::new(options.edge_cache_capacity)),
            options.collapser_options(),
        );
        let sessions = SessionManager::new(streams.clone(), notifier, options.session_limits());
        let publisher = Publisher::new(streams.clone(), cache.clone(), sessions.clone());

        Ok(Self {
            streams,
            cache,
            sessions,
            publisher,
            registry,
            options: Arc::new(options),
        })
    }

    fn authenticate(&self, headers: &HeaderMap, stream: &str) -> Result<AuthContext, ApiError> {
        authenticate(&self.registry, headers, stream)
    }

    fn authorize_admin(&self, headers: &HeaderMap, project: &str) -> Result<(), ApiError> {
        authorize_admin(
            &self.registry,
            headers,
            self.options.admin_token.as_deref(),
            project,
        )
    }
}

/// Query parameters for stream reads.
#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub timeout_ms: Option<u64>,
    pub limit: Option<usize>,
}

/// Query parameters for session polls and registrations.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub offset: Option<String>,
    pub timeout_ms: Option<u64>,
    pub limit: Option<usize>,
}

/// Create the router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.registry);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/v1/stream/{*id}",
            put(handle_create)
                .post(handle_append)
                .get(handle_read)
                .head(handle_head)
                .delete(handle_delete),
        )
        .route("/v1/publish/{*id}", post(handle_publish))
        .route(
            "/v1/subscribe/{*id}",
            post(handle_subscribe).get(handle_discover),
        )
        .route(
            "/v1/sessions/{sid}",
            get(handle_poll).delete(handle_unsubscribe),
        )
        .route("/v1/sessions/{sid}/ack", post(handle_ack))
        .route(
            "/v1/projects/{pid}",
            put(handle_create_project).get(handle_get_project),
        )
        .route("/v1/projects/{pid}/rotate", post(handle_rotate_key))
        .route("/v1/projects/{pid}/cors", put(handle_update_cors))
        .route("/v1/projects/{pid}/tokens", post(handle_issue_token))
        .route("/v1/projects/{pid}/reader-keys", post(handle_reader_key))
        .layer(cors)
        .layer(middleware::from_fn(options_no_content))
        .with_state(state)
}

fn cors_layer(registry: &Arc<ProjectRegistry>) -> CorsLayer {
    let allow_origin = if registry.is_open() {
        AllowOrigin::from(Any)
    } else {
        let registry = registry.clone();
        AllowOrigin::predicate(move |origin, _| {
            origin
                .to_str()
                .is_ok_and(|origin| registry.cors_allows(origin))
        })
    };

    let mut allowed: Vec<HeaderName> = vec![
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        header::IF_NONE_MATCH,
    ];
    allowed.extend(
        [
            headers::STREAM_TTL,
            headers::STREAM_EXPIRES_AT,
            headers::STREAM_SEQ,
            headers::STREAM_READER_KEY,
            headers::STREAM_PROJECT,
            headers::FANOUT_MODE,
            headers::FANOUT_CALLBACK,
            headers::FANOUT_ACK_OFFSET,
        ]
        .iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok()),
    );
    let exposed: Vec<HeaderName> = headers::EXPOSED
        .iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(allowed)
        .expose_headers(exposed)
        .max_age(Duration::from_secs(86_400))
}

/// Answer every OPTIONS request with 204, keeping the CORS headers.
async fn options_no_content(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options {
        *response.status_mut() = StatusCode::NO_CONTENT;
        *response.body_mut() = Body::empty();
        response.headers_mut().remove(header::CONTENT_LENGTH);
        response.headers_mut().remove(header::CONTENT_TYPE);
    }
    response
}

async fn handle_health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

// ==================== Streams ====================

/// PUT - Create a stream
async fn handle_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    validate_stream_id(&id)?;
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Write, &id)?;
    let key = StreamKey::new(&auth.project, &id);

    let ttl = validate_ttl_headers(&headers)?;
    let body = read_body(&headers, body, state.options.max_append_bytes).await?;

    let options = CreateOptions {
        content_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from),
        ttl_seconds: ttl.ttl_seconds,
        expires_at: ttl.expires_at,
        initial_data: (!body.is_empty()).then_some(body),
    };
    if let Some(data) = &options.initial_data {
        validate_append_body(data, &options.resolved_content_type())?;
    }

    debug!(stream = %key, "Creating stream");
    let outcome = state.streams.create(&key, options).await?;
    if outcome.is_created() {
        state.publisher.after_reset(&key);
    }
    let meta = state.streams.meta(&key).await?;

    finish(
        Response::builder()
            .status(if outcome.is_created() {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            })
            .header(headers::STREAM_NEXT_OFFSET, meta.tail.to_string())
            .header(header::LOCATION, format!("/v1/stream/{id}"))
            .header(header::CONTENT_TYPE, &meta.content_type),
        Body::empty(),
    )
}

/// HEAD - Stream metadata
async fn handle_head(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Read, &id)?;
    let meta = state.streams.meta(&StreamKey::new(&auth.project, &id)).await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &meta.content_type)
        .header(headers::STREAM_NEXT_OFFSET, meta.tail.to_string());
    if let Some(ttl) = meta.ttl_seconds {
        response = response.header(headers::STREAM_TTL, ttl.to_string());
    }
    if let Some(expires_at) = meta.expires_at {
        response = response.header(headers::STREAM_EXPIRES_AT, expires_at.to_rfc3339());
    }
    finish(response, Body::empty())
}

/// GET - Read from a stream
async fn handle_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Read, &id)?;
    let key = StreamKey::new(&auth.project, &id);
    let from = ReadFrom::parse(query.offset.as_deref())?;

    let wait = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.options.long_poll_timeout())
        .min(state.options.long_poll_timeout());

    let live = match query.live.as_deref() {
        None | Some("") => LiveMode::CatchUp,
        Some("long-poll") => LiveMode::LongPoll,
        Some("sse") => return handle_sse(state, key, from).await,
        Some(other) => {
            return Err(ApiError::InvalidRequest(format!(
                "Unknown live mode {other:?}"
            )));
        }
    };

    let request = ReadRequest {
        key: key.clone(),
        from,
        live,
        timeout: wait,
        limit: query.limit,
    };
    let (result, status) = state.cache.read(request).await?;

    let Some(result) = result else {
        // Long-poll timeout: the client stays where it was.
        let tail = state.streams.existing(&key)?.tail();
        let position = match from {
            ReadFrom::Start => Offset::start_of(tail.tail.epoch()),
            ReadFrom::At(offset) => offset.min(tail.tail),
        };
        return finish(
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(headers::STREAM_NEXT_OFFSET, position.to_string())
                .header(headers::STREAM_UP_TO_DATE, "true")
                .header(headers::STREAM_CACHE, status.as_str()),
            Body::empty(),
        );
    };

    read_response(&key, from, &result, status, &headers)
}

fn read_response(
    key: &StreamKey,
    from: ReadFrom,
    result: &ReadResult,
    status: CacheStatus,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let etag = generate_etag(key, &from.encode(), &result.next_offset.to_string());
    let builder = Response::builder()
        .header(headers::STREAM_NEXT_OFFSET, result.next_offset.to_string())
        .header(headers::STREAM_UP_TO_DATE, result.up_to_date.to_string())
        .header(headers::STREAM_CACHE, status.as_str())
        .header(header::ETAG, &etag);

    let not_modified = header_str(request_headers, header::IF_NONE_MATCH.as_str())
        .is_some_and(|presented| presented.split(',').any(|tag| tag.trim() == etag));
    if not_modified {
        return finish(builder.status(StatusCode::NOT_MODIFIED), Body::empty());
    }

    finish(
        builder
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, &result.content_type),
        Body::from(result.body()),
    )
}

/// Handle SSE streaming
async fn handle_sse(state: AppState, key: StreamKey, from: ReadFrom) -> Result<Response, ApiError> {
    // Fail fast on a missing stream before committing to an event stream.
    state.streams.meta(&key).await?;
    info!(stream = %key, offset = %from.encode(), "New SSE connection");

    Ok(Sse::new(create_sse_stream(state, key, from))
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response())
}

fn create_sse_stream(
    state: AppState,
    key: StreamKey,
    mut from: ReadFrom,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let wait = state.options.long_poll_timeout();
        loop {
            match state.streams.long_poll(&key, from, None, wait).await {
                Ok(Some(result)) => {
                    for record in &result.records {
                        yield Ok(Event::default().event("data").data(record_text(record)));
                    }
                    from = ReadFrom::At(result.next_offset);
                    yield Ok(control_event(result.next_offset, result.up_to_date));
                }
                Ok(None) => {
                    let position = match from {
                        ReadFrom::At(offset) => offset,
                        ReadFrom::Start => match state.streams.existing(&key) {
                            Ok(handle) => Offset::start_of(handle.tail().tail.epoch()),
                            Err(_) => break,
                        },
                    };
                    yield Ok(control_event(position, true));
                }
                Err(e) => {
                    debug!(stream = %key, error = %e, "Ending SSE stream");
                    let error = json!({ "code": e.code(), "message": e.to_string() });
                    yield Ok(Event::default().event("error").data(error.to_string()));
                    break;
                }
            }
        }
    }
}

fn record_text(record: &Record) -> String {
    String::from_utf8_lossy(&record.data).into_owned()
}

fn control_event(next_offset: Offset, up_to_date: bool) -> Event {
    let control = json!({
        "streamNextOffset": next_offset,
        "upToDate": up_to_date,
    });
    Event::default().event("control").data(control.to_string())
}

/// POST - Append to a stream
async fn handle_append(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Write, &id)?;
    let key = StreamKey::new(&auth.project, &id);

    let body = read_body(&headers, body, state.options.max_append_bytes).await?;
    let meta = state.streams.meta(&key).await?;
    validate_append_body(&body, &meta.content_type)?;

    let outcome = state
        .streams
        .append(
            &key,
            body,
            header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from),
            header_str(&headers, headers::STREAM_SEQ).map(String::from),
        )
        .await?;
    state.publisher.after_append(&key, &outcome);

    finish(
        Response::builder()
            .status(StatusCode::OK)
            .header(headers::STREAM_NEXT_OFFSET, outcome.next_offset.to_string())
            .header(headers::STREAM_OFFSET, outcome.offset.to_string())
            .header(
                headers::STREAM_WRITE_TIMESTAMP,
                outcome.written_at.to_rfc3339(),
            ),
        Body::empty(),
    )
}

/// DELETE - Delete a stream
async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Write, &id)?;
    let key = StreamKey::new(&auth.project, &id);

    state.streams.delete(&key).await?;
    state.publisher.after_reset(&key);
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Fan-out ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    offset: Offset,
    next_offset: Offset,
    created: bool,
}

/// POST /v1/publish - Ensure, append, notify
async fn handle_publish(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    validate_stream_id(&id)?;
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Write, &id)?;
    let key = StreamKey::new(&auth.project, &id);

    let ttl = validate_ttl_headers(&headers)?;
    let data = read_body(&headers, body, state.options.max_append_bytes).await?;
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from);

    let outcome = state
        .publisher
        .publish(PublishRequest {
            key,
            data,
            content_type: content_type.clone(),
            seq: header_str(&headers, headers::STREAM_SEQ).map(String::from),
            create: CreateOptions {
                content_type,
                ttl_seconds: ttl.ttl_seconds,
                expires_at: ttl.expires_at,
                initial_data: None,
            },
        })
        .await?;

    let body = PublishResponse {
        offset: outcome.append.offset,
        next_offset: outcome.append.next_offset,
        created: outcome.created,
    };
    let mut response = axum::Json(body).into_response();
    insert_header(
        response.headers_mut(),
        headers::STREAM_NEXT_OFFSET,
        &outcome.append.next_offset.to_string(),
    );
    Ok(response)
}

/// POST /v1/subscribe - Register a session
async fn handle_subscribe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Subscribe, &id)?;

    let mode = match header_str(&headers, headers::FANOUT_MODE) {
        Some(raw) => raw.parse::<DeliveryMode>().map_err(ApiError::InvalidRequest)?,
        None => DeliveryMode::default(),
    };

    let info = state
        .sessions
        .subscribe(Subscribe {
            key: StreamKey::new(&auth.project, &id),
            mode,
            callback: header_str(&headers, headers::FANOUT_CALLBACK).map(String::from),
            from: ReadFrom::parse(query.offset.as_deref())?,
        })
        .await?;

    let mut response = (StatusCode::CREATED, axum::Json(&info)).into_response();
    insert_header(response.headers_mut(), headers::FANOUT_SESSION_ID, &info.id);
    Ok(response)
}

/// GET /v1/subscribe - Session discovery
async fn handle_discover(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = state.authenticate(&headers, &id)?;
    auth.require(Scope::Subscribe, &id)?;
    let sessions = state.sessions.list(&auth.project, Some(&id));
    Ok(axum::Json(json!({ "sessions": sessions })).into_response())
}

/// Resolve a session the caller is allowed to drive.
fn owned_session(
    state: &AppState,
    headers: &HeaderMap,
    sid: &str,
) -> Result<durastream_types::SessionInfo, ApiError> {
    let info = state.sessions.get(sid)?;
    let auth = state.authenticate(headers, &info.stream)?;
    if auth.project != info.project {
        return Err(ApiError::not_found(format!("session {sid}")));
    }
    auth.require(Scope::Subscribe, &info.stream)?;
    Ok(info)
}

/// GET /v1/sessions/{sid} - Poll without advancing
async fn handle_poll(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    owned_session(&state, &headers, &sid)?;

    let wait = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.options.long_poll_timeout())
        .min(state.options.long_poll_timeout());
    let (info, result) = state.sessions.poll(&sid, wait, query.limit).await?;

    match result {
        Some(result) => finish(
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, &result.content_type)
                .header(headers::STREAM_NEXT_OFFSET, result.next_offset.to_string())
                .header(headers::STREAM_UP_TO_DATE, result.up_to_date.to_string())
                .header(headers::FANOUT_SESSION_ID, &info.id),
            Body::from(result.body()),
        ),
        None => finish(
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(headers::STREAM_NEXT_OFFSET, info.last_offset.to_string())
                .header(headers::STREAM_UP_TO_DATE, "true")
                .header(headers::FANOUT_SESSION_ID, &info.id),
            Body::empty(),
        ),
    }
}

/// POST /v1/sessions/{sid}/ack - Advance and renew
async fn handle_ack(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    owned_session(&state, &headers, &sid)?;

    let raw = header_str(&headers, headers::FANOUT_ACK_OFFSET)
        .map(String::from)
        .or(query.offset)
        .ok_or_else(|| ApiError::InvalidRequest("Missing ack offset".to_string()))?;
    let offset: Offset = raw.parse()?;

    let info = state.sessions.ack(&sid, offset)?;
    Ok(axum::Json(info).into_response())
}

/// DELETE /v1/sessions/{sid}
async fn handle_unsubscribe(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    owned_session(&state, &headers, &sid)?;
    state.sessions.unsubscribe(&sid)?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Projects ====================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CreateProjectBody {
    cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorsBody {
    origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    scopes: Vec<Scope>,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReaderKeyBody {
    stream: String,
}

async fn handle_create_project(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    let body: CreateProjectBody = if body.is_empty() {
        CreateProjectBody::default()
    } else {
        parse_json(&body)?
    };
    let credentials = state.registry.create(&pid, body.cors_origins)?;
    Ok((StatusCode::CREATED, axum::Json(credentials)).into_response())
}

async fn handle_get_project(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    Ok(axum::Json(state.registry.get(&pid)?).into_response())
}

async fn handle_rotate_key(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    Ok(axum::Json(state.registry.rotate_signing_key(&pid)?).into_response())
}

async fn handle_update_cors(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    let body: CorsBody = parse_json(&body)?;
    Ok(axum::Json(state.registry.update_cors(&pid, body.origins)?).into_response())
}

async fn handle_issue_token(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    let body: TokenBody = parse_json(&body)?;
    let ttl = body.ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    let token = state
        .registry
        .issue_token(&pid, body.scopes, body.stream, ttl)?;
    Ok(axum::Json(json!({ "token": token, "expiresIn": ttl })).into_response())
}

async fn handle_reader_key(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.authorize_admin(&headers, &pid)?;
    let body: ReaderKeyBody = parse_json(&body)?;
    validate_stream_id(&body.stream)?;
    let key = state.registry.reader_key(&pid, &body.stream)?;
    Ok(axum::Json(json!({ "stream": body.stream, "readerKey": key })).into_response())
}

// ==================== Helpers ====================

/// Read a request body, enforcing the append size limit and checking the
/// declared `Content-Length` against what actually arrived.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, ApiError> {
    let declared = header_str(headers, header::CONTENT_LENGTH.as_str());
    if let Some(declared) = declared.and_then(|raw| raw.trim().parse::<usize>().ok()) {
        validate_body_size(declared, limit)?;
    }

    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to read body: {e}")))?;
        buf.extend_from_slice(&chunk);
        validate_body_size(buf.len(), limit)?;
    }

    validate_content_length(declared, buf.len())?;
    Ok(buf.freeze())
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON body: {e}")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        header::HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn finish(builder: Builder, body: Body) -> Result<Response, ApiError> {
    builder
        .body(body)
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))
}

/// Generate an ETag for a read response.
fn generate_etag(key: &StreamKey, start_offset: &str, end_offset: &str) -> String {
    let key_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key.to_string());
    format!("\"{key_b64}:{start_offset}:{end_offset}\"")
}

/// Start the server.
pub async fn start_server(options: ServerOptions) -> std::io::Result<()> {
    let addr = options.bind_address();
    let state = AppState::new(options).map_err(std::io::Error::other)?;
    let open = state.registry.is_open();
    let router = create_router(state);

    info!(address = %addr, open_mode = open, "Starting durable streams server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn create_test_app() -> Router {
        create_router(AppState::new(ServerOptions::default()).unwrap())
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn put_stream(path: &str, content_type: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(path)
            .header("Content-Type", content_type)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_stream() {
        let app = create_test_app();
        let response = send(&app, put_stream("/v1/stream/test/stream", "text/plain")).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()["stream-next-offset"],
            "0_0000000000000000"
        );
    }

    #[tokio::test]
    async fn test_create_idempotent() {
        let app = create_test_app();
        let first = send(&app, put_stream("/v1/stream/test/stream", "text/plain")).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = send(&app, put_stream("/v1/stream/test/stream", "text/plain")).await;
        assert_eq!(second.status(), StatusCode::OK);

        let conflicting = send(&app, put_stream("/v1/stream/test/stream", "application/json")).await;
        assert_eq!(conflicting.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let app = create_test_app();
        send(&app, put_stream("/v1/stream/test/stream", "text/plain")).await;

        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/v1/stream/test/stream")
                .header("Content-Type", "text/plain")
                .body(Body::from("hello world"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["stream-offset"], "0_0000000000000000");
        assert_eq!(
            response.headers()["stream-next-offset"],
            "0_0000000000000001"
        );
        assert!(response.headers().contains_key("stream-write-timestamp"));

        let response = send(
            &app,
            Request::builder()
                .uri("/v1/stream/test/stream?offset=-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["stream-up-to-date"], "true");
        assert!(response.headers().contains_key("etag"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_if_none_match_returns_not_modified() {
        let app = create_test_app();
        send(&app, put_stream("/v1/stream/etag", "text/plain")).await;

        let first = send(
            &app,
            Request::builder()
                .uri("/v1/stream/etag")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let etag = first.headers()["etag"].clone();

        let second = send(
            &app,
            Request::builder()
                .uri("/v1/stream/etag")
                .header("If-None-Match", etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_malformed_offset() {
        let app = create_test_app();
        send(&app, put_stream("/v1/stream/s", "text/plain")).await;
        let response = send(
            &app,
            Request::builder()
                .uri("/v1/stream/s?offset=garbage")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_head_reports_tail() {
        let app = create_test_app();
        let create = Request::builder()
            .method("PUT")
            .uri("/v1/stream/h")
            .header("Content-Type", "text/plain")
            .header("Stream-TTL", "60")
            .body(Body::from("seed"))
            .unwrap();
        send(&app, create).await;

        let response = send(
            &app,
            Request::builder()
                .method("HEAD")
                .uri("/v1/stream/h")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["stream-next-offset"],
            "0_0000000000000001"
        );
        assert_eq!(response.headers()["stream-ttl"], "60");
    }

    #[tokio::test]
    async fn test_create_rejects_already_expired_lifetime() {
        let app = create_test_app();
        for (name, value) in [
            ("Stream-TTL", "0"),
            ("Stream-Expires-At", "2001-01-01T00:00:00Z"),
        ] {
            let create = Request::builder()
                .method("PUT")
                .uri("/v1/stream/brief")
                .header("Content-Type", "text/plain")
                .header(name, value)
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&app, create).await.status(), StatusCode::BAD_REQUEST);
        }

        let head = Request::builder()
            .method("HEAD")
            .uri("/v1/stream/brief")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, head).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_stream() {
        let app = create_test_app();
        send(&app, put_stream("/v1/stream/test/stream", "text/plain")).await;

        let response = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri("/v1/stream/test/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(
            &app,
            Request::builder()
                .uri("/v1/stream/test/stream?offset=-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_test_app();
        let response = send(
            &app,
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_etag_is_quoted() {
        let etag = generate_etag(&StreamKey::new("p", "s"), "-1", "0_0000000000000001");
        assert!(etag.starts_with('"') && etag.ends_with('"'));
    }
}
