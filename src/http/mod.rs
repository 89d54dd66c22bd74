//! HTTP transport for MCP.
//!
//! `POST /mcp` carries JSON-RPC, `GET /mcp/sse` (or `GET /mcp`) opens the
//! session's event stream, and `DELETE /mcp` drops a session. Every request
//! passes an origin check first.

pub mod sse;
mod stream;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{Config, SseConfig};
use crate::error::{Error, Result};
use crate::mcp::dispatcher::{error_body, RpcDispatcher};
use crate::mcp::handler::{DefaultToolExecutor, ToolExecutor, ToolRegistry};
use crate::mcp::manager::SessionManager;
use crate::mcp::protocol::{error_codes, methods, JsonRpcResponse};
use crate::mcp::router::ProjectRouter;
use crate::metrics::Metrics;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROJECT_PATH_HEADER: &str = "project_path";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const MCP_ALLOW: &str = "POST, GET, DELETE";
const SSE_ALLOW: &str = "GET";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<RpcDispatcher>,
    pub metrics: Arc<Metrics>,
    pub sse: SseConfig,
    pub max_body_bytes: usize,
    /// Cleared on shutdown; streaming loops stop at their next iteration.
    pub running: Arc<AtomicBool>,
}

impl AppState {
    /// Wire up the session table, dispatcher and executor around the given
    /// project router and tool registry.
    pub fn new(
        config: &Config,
        router: Arc<dyn ProjectRouter>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        let metrics = Metrics::new();
        let sessions = Arc::new(SessionManager::new(
            router.clone(),
            config.sse,
            metrics.clone(),
        ));
        let executor: Arc<dyn ToolExecutor> = Arc::new(DefaultToolExecutor::new(tools.clone()));
        let dispatcher = Arc::new(RpcDispatcher::new(
            router,
            sessions.clone(),
            tools,
            executor,
            metrics.clone(),
        ));

        Self {
            sessions,
            dispatcher,
            metrics,
            sse: config.sse,
            max_body_bytes: config.max_body_bytes,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp",
            get(stream::handle_sse)
                .post(handle_post)
                .delete(handle_delete)
                .fallback(|| async { method_not_allowed(MCP_ALLOW) }),
        )
        .route(
            "/mcp/sse",
            get(stream::handle_sse).fallback(|| async { method_not_allowed(SSE_ALLOW) }),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_export))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(state.clone(), guard_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Origin check, HTTP metrics and security headers for every request.
async fn guard_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.metrics.record_http_request(request.method().as_str());

    let origin = header_value(request.headers(), header::ORIGIN.as_str()).map(str::to_owned);
    let mut response = if is_origin_allowed(origin.as_deref()) {
        next.run(request).await
    } else {
        debug!("Forbidden origin: {:?}", origin);
        json_response(
            StatusCode::FORBIDDEN,
            error_body(error_codes::INVALID_REQUEST, "Forbidden origin"),
        )
    };

    state.metrics.record_http_response(response.status().as_u16());
    if !is_event_stream(&response) {
        apply_security_headers(response.headers_mut());
    }
    response
}

/// `POST /mcp`: one JSON-RPC request in, one response (or 202) out.
async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let content_type = header_value(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if !content_type.to_ascii_lowercase().starts_with("application/json") {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let declared_length = header_value(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared_length.is_some_and(|len| len > state.max_body_bytes as u64) {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Rejected request body: {}", e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(request)) => request,
        Ok(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                error_body(error_codes::INVALID_REQUEST, "Invalid request"),
            )
        }
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                error_body(error_codes::PARSE_ERROR, "Parse error"),
            )
        }
    };

    let session_header = header_value(&headers, SESSION_ID_HEADER);
    let project_path_header = header_value(&headers, PROJECT_PATH_HEADER);
    let Some(rpc_response) = state
        .dispatcher
        .handle_rpc(&request, session_header, project_path_header)
        .await
    else {
        return StatusCode::ACCEPTED.into_response();
    };

    let status = status_for_response(&rpc_response);
    let is_initialize = request.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE);
    let new_session_id = if is_initialize && status == StatusCode::OK {
        rpc_response
            .result
            .as_ref()
            .and_then(|result| result.get("_sessionId"))
            .and_then(Value::as_str)
            .and_then(|id| HeaderValue::from_str(id).ok())
    } else {
        None
    };

    let mut response = json_response(status, rpc_response);
    if let Some(session_id) = new_session_id {
        response.headers_mut().insert(SESSION_ID_HEADER, session_id);
    }
    response
}

/// `DELETE /mcp`: idempotent session removal.
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) =
        header_value(&headers, SESSION_ID_HEADER).filter(|id| !id.trim().is_empty())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if state.sessions.remove_session(Some(session_id)).is_some() {
        debug!("Session deleted: {}", session_id);
    }
    StatusCode::ACCEPTED.into_response()
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION
    }))
}

/// Prometheus text exposition of the transport counters.
async fn metrics_export(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot(state.sessions.snapshot());
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        snapshot.to_prometheus(),
    )
}

fn method_not_allowed(allow: &'static str) -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, allow)]).into_response()
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    warn!("Failed to process MCP HTTP request: {}", detail);
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_body(error_codes::INTERNAL_ERROR, "Internal error"),
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}

fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

fn is_event_stream(response: &Response) -> bool {
    header_value(response.headers(), header::CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// First value of a header, if it is valid visible ASCII.
pub(crate) fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Only loopback `http`/`https` origins are allowed. No `Origin` header
/// means a same-origin or non-browser client.
pub fn is_origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let Ok(uri) = origin.trim().parse::<Uri>() else {
        return false;
    };

    let scheme_ok = uri
        .scheme_str()
        .is_some_and(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"));
    if !scheme_ok {
        return false;
    }

    let Some(authority) = uri.authority() else {
        return false;
    };
    if authority.as_str().contains('@') {
        return false;
    }

    matches!(
        authority.host().to_ascii_lowercase().as_str(),
        "localhost" | "127.0.0.1" | "[::1]" | "::1"
    )
}

/// HTTP status for a JSON-RPC error code.
pub fn status_for_error_code(code: i32) -> StatusCode {
    match code {
        error_codes::PARSE_ERROR | error_codes::INVALID_REQUEST | error_codes::INVALID_PARAMS => {
            StatusCode::BAD_REQUEST
        }
        error_codes::METHOD_NOT_FOUND
        | error_codes::PROJECT_NOT_FOUND
        | error_codes::SESSION_NOT_FOUND => StatusCode::NOT_FOUND,
        error_codes::PROJECT_MISMATCH | error_codes::SESSION_NOT_INITIALIZED => {
            StatusCode::CONFLICT
        }
        error_codes::INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        code if (error_codes::SERVER_ERROR_MIN..=error_codes::SERVER_ERROR_MAX).contains(&code) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_for_response(response: &JsonRpcResponse) -> StatusCode {
    response
        .error_code()
        .map_or(StatusCode::OK, status_for_error_code)
}

/// A running HTTP server plus its expiry sweeper.
pub struct HttpServer {
    local_addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    serve_task: JoinHandle<std::io::Result<()>>,
    sweeper_task: JoinHandle<()>,
    grace: Duration,
}

impl HttpServer {
    /// Bind, start serving and start the sweeper.
    ///
    /// Falls back to an ephemeral port when the configured one is taken.
    pub async fn start(config: &Config, state: AppState) -> Result<Self> {
        let listener = match TcpListener::bind(config.bind_addr()).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(
                    "Port {} is in use, falling back to an ephemeral port",
                    config.port
                );
                TcpListener::bind((config.listen_address.as_str(), 0))
                    .await
                    .map_err(|e| Error::HttpServer(format!("Failed to bind ephemeral port: {}", e)))?
            }
            Err(e) => {
                return Err(Error::HttpServer(format!(
                    "Failed to bind {}: {}",
                    config.bind_addr(),
                    e
                )))
            }
        };
        let local_addr = listener.local_addr()?;

        state.running.store(true, Ordering::Release);
        let shutdown = CancellationToken::new();

        let app = build_router(state.clone());
        let serve_shutdown = shutdown.clone();
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await
        });
        let sweeper_task = tokio::spawn(run_sweeper(state.clone(), shutdown.clone()));

        info!("MCP server listening on http://{}", local_addr);

        Ok(Self {
            local_addr,
            state,
            shutdown,
            serve_task,
            sweeper_task,
            grace: config.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop the sweeper, stop accepting connections, give in-flight requests
    /// the grace period, then close every session.
    pub async fn stop(self) {
        info!("Stopping MCP server on {}", self.local_addr);
        self.state.running.store(false, Ordering::Release);
        self.shutdown.cancel();

        if let Err(e) = self.sweeper_task.await {
            warn!("Sweeper task failed: {}", e);
        }

        let mut serve_task = self.serve_task;
        match tokio::time::timeout(self.grace, &mut serve_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {}", e),
            Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
            Err(_) => {
                warn!(
                    "HTTP server did not drain within {}ms, aborting",
                    self.grace.as_millis()
                );
                serve_task.abort();
            }
        }

        self.state.sessions.clear_all();
        info!("MCP server stopped");
    }
}

async fn run_sweeper(state: AppState, shutdown: CancellationToken) {
    let interval = state.sse.heartbeat_interval().max(Duration::from_millis(1));
    let timeout = state.sse.session_timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    info!(
        "SSE heartbeat scheduler started with interval {}s",
        interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = state.sessions.cleanup_expired_sessions(timeout);
                if removed > 0 {
                    debug!("Cleaned up {} expired sessions", removed);
                }
                debug!(
                    "{}",
                    state.metrics.snapshot(state.sessions.snapshot()).to_log_line()
                );
            }
        }
    }
}
