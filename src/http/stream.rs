//! Per-connection SSE streaming.
//!
//! A GET on the stream endpoint claims the session's single stream slot, then
//! hands the response body to a task that replays missed events and drains the
//! session queue until the session closes, expires, or the client goes away.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sse::{self, escape_json_newlines, SseEventWriter, EVENT_ERROR, EVENT_MESSAGE};
use super::{header_value, AppState, LAST_EVENT_ID_HEADER, PROJECT_PATH_HEADER, SESSION_ID_HEADER};
use crate::error::Result;
use crate::mcp::protocol::error_codes;
use crate::mcp::session::{QueuedEvent, Session};

const STREAM_BUFFER_BYTES: usize = 16 * 1024;

/// Why a stream request was turned away before attaching.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    NotAcceptable,
    MissingSession,
    SessionNotFound(String),
    SessionClosed(String),
    ProjectMismatch(String),
    AlreadyAttached(String),
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Self::MissingSession => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) | Self::SessionClosed(_) => StatusCode::NOT_FOUND,
            Self::ProjectMismatch(_) | Self::AlreadyAttached(_) => StatusCode::CONFLICT,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::NotAcceptable => "not_acceptable",
            Self::MissingSession => "missing_session",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionClosed(_) => "session_closed",
            Self::ProjectMismatch(_) => "project_mismatch",
            Self::AlreadyAttached(_) => "already_attached",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAcceptable => write!(f, "Accept header does not admit text/event-stream"),
            Self::MissingSession => write!(f, "Missing session ID header"),
            Self::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            Self::SessionClosed(id) => write!(f, "Session already closed: {}", id),
            Self::ProjectMismatch(id) => write!(f, "PROJECT_PATH mismatch for session: {}", id),
            Self::AlreadyAttached(id) => write!(f, "Stream already attached for session: {}", id),
        }
    }
}

/// Releases the stream slot however the streaming task ends.
struct StreamGuard {
    state: AppState,
    session: Arc<Session>,
    request_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.session.detach_stream();
        self.state.metrics.record_sse_closed();
        info!(
            "[{}] SSE disconnected for session: {} (queueSize={}, dropped={})",
            self.request_id,
            self.session.id(),
            self.session.queue_len(),
            self.session.dropped_count()
        );
    }
}

/// Everything the streaming task needs after the response has been handed off.
struct StreamContext {
    state: AppState,
    session: Arc<Session>,
    project_path_header: Option<String>,
    last_event_id: Option<u64>,
    request_id: String,
}

/// `GET /mcp/sse` (and `GET /mcp`).
pub(crate) async fn handle_sse(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = short_request_id();
    debug!("[{}] SSE connection request", request_id);

    match attach(&state, &headers, &request_id) {
        Ok((ctx, guard)) => open_stream(ctx, guard),
        Err(rejection) => {
            debug!("[{}] {}", request_id, rejection);
            state.metrics.record_sse_rejected(rejection.reason());
            rejection.status().into_response()
        }
    }
}

/// Run the entry checks in order and claim the stream slot.
fn attach(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> std::result::Result<(StreamContext, StreamGuard), Rejection> {
    if !accepts_event_stream(header_value(headers, header::ACCEPT.as_str())) {
        return Err(Rejection::NotAcceptable);
    }

    let session_id = header_value(headers, SESSION_ID_HEADER)
        .filter(|id| !id.trim().is_empty())
        .ok_or(Rejection::MissingSession)?;
    let project_path_header = header_value(headers, PROJECT_PATH_HEADER);

    let session = state
        .sessions
        .get_session(Some(session_id))
        .ok_or_else(|| Rejection::SessionNotFound(session_id.to_string()))?;
    if session.is_closed() {
        return Err(Rejection::SessionClosed(session_id.to_string()));
    }
    if state
        .sessions
        .validate_project_path_header(project_path_header, &session)
        .is_err()
    {
        return Err(Rejection::ProjectMismatch(session_id.to_string()));
    }

    session.touch();
    if !session.attach_stream() {
        return Err(Rejection::AlreadyAttached(session_id.to_string()));
    }

    state.metrics.record_sse_opened();
    info!("[{}] SSE connected for session: {}", request_id, session_id);

    let guard = StreamGuard {
        state: state.clone(),
        session: session.clone(),
        request_id: request_id.to_string(),
    };
    let ctx = StreamContext {
        state: state.clone(),
        session,
        project_path_header: project_path_header.map(String::from),
        last_event_id: parse_last_event_id(header_value(headers, LAST_EVENT_ID_HEADER)),
        request_id: request_id.to_string(),
    };
    Ok((ctx, guard))
}

fn open_stream(ctx: StreamContext, guard: StreamGuard) -> Response {
    let (writer, reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
    tokio::spawn(serve_stream(ctx, guard, writer));

    let mut response = Body::from_stream(ReaderStream::new(reader)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(sse::CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(sse::CACHE_CONTROL));
    headers.insert(header::CONNECTION, HeaderValue::from_static(sse::CONNECTION));
    headers.insert("x-accel-buffering", HeaderValue::from_static(sse::X_ACCEL_BUFFERING));
    response
}

async fn serve_stream<W: AsyncWrite + Unpin>(ctx: StreamContext, guard: StreamGuard, sink: W) {
    let _guard = guard;
    let mut writer = SseEventWriter::new(sink, ctx.state.sse.retry_timeout_ms);

    match stream_events(&ctx, &mut writer).await {
        Ok(()) => {
            if let Err(e) = writer.into_inner().shutdown().await {
                debug!("[{}] SSE sink shutdown failed: {}", ctx.request_id, e);
            }
        }
        Err(e) if e.is_disconnect() => {
            info!("[{}] Client disconnected: {}", ctx.request_id, e);
        }
        Err(e) => {
            warn!("[{}] SSE stream failed: {}", ctx.request_id, e);
        }
    }
}

async fn stream_events<W: AsyncWrite + Unpin>(
    ctx: &StreamContext,
    writer: &mut SseEventWriter<W>,
) -> Result<()> {
    let state = &ctx.state;
    let session = &ctx.session;
    let metrics = &state.metrics;

    writer.send_initial_handshake().await?;
    session.touch();

    let missed = session.events_after(ctx.last_event_id);
    for (event_id, payload) in &missed {
        writer
            .send_event(EVENT_MESSAGE, *event_id, &escape_json_newlines(payload))
            .await?;
        metrics.record_sse_event(EVENT_MESSAGE);
        session.touch();
    }
    if !missed.is_empty() {
        debug!("[{}] Replayed {} events", ctx.request_id, missed.len());
    }

    if missed.is_empty() && ctx.last_event_id.is_none() {
        let event_id = session.next_event_id();
        let initial_payload = "{}";
        session.record_event(event_id, initial_payload);
        writer.send_event(EVENT_MESSAGE, event_id, initial_payload).await?;
        metrics.record_sse_event(EVENT_MESSAGE);
        session.touch();
    }

    let keep_alive = state.sse.keep_alive();
    let mut last_keep_alive = Instant::now();

    while session.stream_attached() && state.running.load(Ordering::Acquire) {
        if !state.sessions.contains(session.id()) {
            writer
                .send_error(
                    session.next_event_id(),
                    error_codes::SESSION_NOT_FOUND,
                    "Session not found",
                    None,
                )
                .await?;
            metrics.record_sse_event(EVENT_ERROR);
            break;
        }

        if session.is_expired(state.sse.session_timeout()) {
            writer
                .send_error(
                    session.next_event_id(),
                    error_codes::SESSION_NOT_FOUND,
                    "Session expired",
                    None,
                )
                .await?;
            metrics.record_sse_event(EVENT_ERROR);
            state.sessions.remove_if_same(session, true);
            break;
        }

        if let Err(mismatch) = state
            .sessions
            .validate_project_path_header(ctx.project_path_header.as_deref(), session)
        {
            let details = mismatch.to_string();
            writer
                .send_error(
                    session.next_event_id(),
                    error_codes::PROJECT_MISMATCH,
                    "PROJECT_PATH does not match session-bound project",
                    Some(&details),
                )
                .await?;
            metrics.record_sse_event(EVENT_ERROR);
            break;
        }

        match session.poll_event(keep_alive).await {
            Some(QueuedEvent::Terminate) => break,
            Some(QueuedEvent::Message(payload)) => {
                let event_id = session.next_event_id();
                session.record_event(event_id, payload.as_str());
                writer
                    .send_event(EVENT_MESSAGE, event_id, &escape_json_newlines(&payload))
                    .await?;
                metrics.record_sse_event(EVENT_MESSAGE);
                session.touch();
                last_keep_alive = Instant::now();
            }
            None => {
                if last_keep_alive.elapsed() >= keep_alive {
                    writer.send_keep_alive().await?;
                    metrics.record_sse_event("keep_alive");
                    session.touch();
                    last_keep_alive = Instant::now();
                }
            }
        }
    }

    Ok(())
}

/// An absent `Accept` header admits anything.
fn accepts_event_stream(accept: Option<&str>) -> bool {
    let Some(accept) = accept else {
        return true;
    };
    accept.split(',').any(|range| {
        let media = range.split(';').next().unwrap_or_default().trim();
        media.eq_ignore_ascii_case("text/event-stream")
            || media.eq_ignore_ascii_case("text/*")
            || media == "*/*"
    })
}

/// Non-numeric values count as no marker at all.
fn parse_last_event_id(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}

fn short_request_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SseConfig};
    use crate::mcp::handler::InMemoryToolRegistry;
    use crate::mcp::router::WorkspaceRegistry;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn state_with(sse: SseConfig) -> AppState {
        let config = Config {
            sse,
            ..Config::default()
        };
        let registry = Arc::new(WorkspaceRegistry::new());
        AppState::new(&config, registry, Arc::new(InMemoryToolRegistry::new()))
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_accepts_event_stream() {
        assert!(accepts_event_stream(None));
        assert!(accepts_event_stream(Some("text/event-stream")));
        assert!(accepts_event_stream(Some("application/json, text/*;q=0.5")));
        assert!(accepts_event_stream(Some("*/*")));
        assert!(accepts_event_stream(Some("Text/Event-Stream; charset=utf-8")));
        assert!(!accepts_event_stream(Some("application/json")));
        assert!(!accepts_event_stream(Some("")));
    }

    #[test]
    fn test_parse_last_event_id() {
        assert_eq!(parse_last_event_id(None), None);
        assert_eq!(parse_last_event_id(Some("42")), Some(42));
        assert_eq!(parse_last_event_id(Some(" 7 ")), Some(7));
        assert_eq!(parse_last_event_id(Some("abc")), None);
        assert_eq!(parse_last_event_id(Some("-1")), None);
    }

    #[test]
    fn test_short_request_id() {
        let id = short_request_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_request_id());
    }

    #[tokio::test]
    async fn test_attach_rejections_in_order() {
        let state = state_with(SseConfig::default());
        let session = state.sessions.create_session("/work/a");

        let err = attach(&state, &headers(&[("accept", "application/json")]), "r").err();
        assert_eq!(err, Some(Rejection::NotAcceptable));

        let err = attach(&state, &headers(&[]), "r").err();
        assert_eq!(err, Some(Rejection::MissingSession));

        let err = attach(&state, &headers(&[(SESSION_ID_HEADER, "nope")]), "r").err();
        assert_eq!(err.map(|r| r.status()), Some(StatusCode::NOT_FOUND));

        let err = attach(
            &state,
            &headers(&[(SESSION_ID_HEADER, session.id()), (PROJECT_PATH_HEADER, "/work/b")]),
            "r",
        )
        .err();
        assert_eq!(err, Some(Rejection::ProjectMismatch(session.id().to_string())));

        let (_ctx, _guard) = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r")
            .unwrap_or_else(|r| panic!("unexpected rejection: {}", r));
        assert!(session.stream_attached());

        let err = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r").err();
        assert_eq!(err.map(|r| r.status()), Some(StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn test_guard_detaches_on_drop() {
        let state = state_with(SseConfig::default());
        let session = state.sessions.create_session("/work/a");

        let attached = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r");
        assert!(attached.is_ok());
        assert!(session.stream_attached());

        drop(attached);
        assert!(!session.stream_attached());
        assert!(session.attach_stream());
    }

    #[tokio::test]
    async fn test_stream_delivers_then_ends_on_close() {
        let state = state_with(SseConfig::default());
        let session = state.sessions.create_session("/work/a");
        session.offer_event("{\"n\":1}");

        let (ctx, guard) = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r")
            .unwrap_or_else(|r| panic!("unexpected rejection: {}", r));
        let (writer, mut reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
        let task = tokio::spawn(serve_stream(ctx, guard, writer));

        tokio::time::sleep(Duration::from_millis(50)).await;
        state.sessions.remove_session(Some(session.id()));

        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();
        task.await.unwrap();

        assert!(out.starts_with("retry: 3000\n\n"));
        assert!(out.contains("event: message\nid: 1\ndata: {}\n\n"));
        assert!(out.contains("event: message\nid: 2\ndata: {\"n\":1}\n\n"));
        assert!(!session.stream_attached());
        assert_eq!(session.history_len(), 2);
    }

    #[tokio::test]
    async fn test_stream_replays_after_last_event_id() {
        let state = state_with(SseConfig::default());
        let session = state.sessions.create_session("/work/a");
        for payload in ["{\"a\":1}", "{\"a\":2}", "{\"a\":3}"] {
            let id = session.next_event_id();
            session.record_event(id, payload);
        }

        let (ctx, guard) = attach(
            &state,
            &headers(&[(SESSION_ID_HEADER, session.id()), (LAST_EVENT_ID_HEADER, "1")]),
            "r",
        )
        .unwrap_or_else(|r| panic!("unexpected rejection: {}", r));
        let (writer, mut reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
        let task = tokio::spawn(serve_stream(ctx, guard, writer));

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();

        let id2 = out.find("id: 2\n").unwrap();
        let id3 = out.find("id: 3\n").unwrap();
        assert!(id2 < id3);
        assert!(!out.contains("id: 1\n"));
        assert!(!out.contains("data: {}\n"));
    }

    #[tokio::test]
    async fn test_stream_sends_keep_alive_when_idle() {
        let state = state_with(SseConfig {
            keep_alive_ms: 20,
            ..SseConfig::default()
        });
        let session = state.sessions.create_session("/work/a");

        let (ctx, guard) = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r")
            .unwrap_or_else(|r| panic!("unexpected rejection: {}", r));
        let (writer, mut reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
        let task = tokio::spawn(serve_stream(ctx, guard, writer));

        tokio::time::sleep(Duration::from_millis(120)).await;
        session.close();

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();

        assert!(out.contains(": ping\n\n"));
    }

    #[tokio::test]
    async fn test_stream_ends_when_client_goes_away() {
        let state = state_with(SseConfig {
            keep_alive_ms: 10,
            ..SseConfig::default()
        });
        let session = state.sessions.create_session("/work/a");

        let (ctx, guard) = attach(&state, &headers(&[(SESSION_ID_HEADER, session.id())]), "r")
            .unwrap_or_else(|r| panic!("unexpected rejection: {}", r));
        let (writer, reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
        let task = tokio::spawn(serve_stream(ctx, guard, writer));
        drop(reader);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.stream_attached());
        assert!(!session.is_closed());
    }
}
