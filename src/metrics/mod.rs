//! Transport metrics for monitoring.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::mcp::protocol::methods;

/// Label for client-supplied values outside the known set.
pub const UNKNOWN_LABEL: &str = "unknown";

const RPC_METHODS: [&str; 4] = [
    methods::INITIALIZE,
    methods::INITIALIZED,
    methods::TOOLS_LIST,
    methods::TOOLS_CALL,
];

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    http_requests_total: AtomicU64,
    http_requests_by_method: DashMap<String, AtomicU64>,
    http_responses_by_status: DashMap<u16, AtomicU64>,
    rpc_calls_by_method: DashMap<String, AtomicU64>,
    rpc_errors_by_code: DashMap<i32, AtomicU64>,
    sessions_created: AtomicU64,
    sessions_removed: AtomicU64,
    sessions_expired: AtomicU64,
    sse_connections_opened: AtomicU64,
    sse_connections_closed: AtomicU64,
    sse_rejected_by_reason: DashMap<String, AtomicU64>,
    sse_events_by_type: DashMap<String, AtomicU64>,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_http_request(&self, method: &str) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        increment(&self.http_requests_by_method, http_method_label(method).to_string());
    }

    pub fn record_http_response(&self, status: u16) {
        increment(&self.http_responses_by_status, status);
    }

    pub fn record_rpc_call(&self, method: &str) {
        increment(&self.rpc_calls_by_method, rpc_method_label(method).to_string());
    }

    pub fn record_rpc_error(&self, code: i32) {
        increment(&self.rpc_errors_by_code, code);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_removed(&self, count: usize, expired: bool) {
        if count == 0 {
            return;
        }
        let count = count as u64;
        self.sessions_removed.fetch_add(count, Ordering::Relaxed);
        if expired {
            self.sessions_expired.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_sse_opened(&self) {
        self.sse_connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sse_closed(&self) {
        self.sse_connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sse_rejected(&self, reason: &str) {
        increment(&self.sse_rejected_by_reason, reason.to_string());
    }

    pub fn record_sse_event(&self, event_type: &str) {
        increment(&self.sse_events_by_type, event_type.to_string());
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self, sessions: SessionSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_requests_by_method: collect(&self.http_requests_by_method),
            http_responses_by_status: collect(&self.http_responses_by_status),
            rpc_calls_by_method: collect(&self.rpc_calls_by_method),
            rpc_errors_by_code: collect(&self.rpc_errors_by_code),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            sse_connections_opened: self.sse_connections_opened.load(Ordering::Relaxed),
            sse_connections_closed: self.sse_connections_closed.load(Ordering::Relaxed),
            sse_rejected_by_reason: collect(&self.sse_rejected_by_reason),
            sse_events_by_type: collect(&self.sse_events_by_type),
            sessions,
        }
    }
}

/// GET, POST and DELETE keep their own label; anything else is `OTHER`.
fn http_method_label(method: &str) -> &'static str {
    match method.to_ascii_uppercase().as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "DELETE" => "DELETE",
        _ => "OTHER",
    }
}

fn rpc_method_label(method: &str) -> &'static str {
    RPC_METHODS
        .iter()
        .find(|known| **known == method)
        .copied()
        .unwrap_or(UNKNOWN_LABEL)
}

fn increment<K: Eq + Hash>(map: &DashMap<K, AtomicU64>, key: K) {
    map.entry(key)
        .or_default()
        .fetch_add(1, Ordering::Relaxed);
}

fn collect<K: Eq + Hash + Ord + Clone>(map: &DashMap<K, AtomicU64>) -> BTreeMap<K, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

/// Point-in-time view of the session table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub total: usize,
    pub initialized: usize,
    pub stream_attached: usize,
    pub closed: usize,
    pub queued_events: usize,
    pub dropped_events: u64,
}

impl SessionSnapshot {
    pub fn to_log_fragment(&self) -> String {
        format!(
            "session={{total={} initialized={} streamAttached={} closed={} queuedEvents={} droppedEvents={}}}",
            self.total,
            self.initialized,
            self.stream_attached,
            self.closed,
            self.queued_events,
            self.dropped_events
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub http_requests_total: u64,
    pub http_requests_by_method: BTreeMap<String, u64>,
    pub http_responses_by_status: BTreeMap<u16, u64>,
    pub rpc_calls_by_method: BTreeMap<String, u64>,
    pub rpc_errors_by_code: BTreeMap<i32, u64>,
    pub sessions_created: u64,
    pub sessions_removed: u64,
    pub sessions_expired: u64,
    pub sse_connections_opened: u64,
    pub sse_connections_closed: u64,
    pub sse_rejected_by_reason: BTreeMap<String, u64>,
    pub sse_events_by_type: BTreeMap<String, u64>,
    pub sessions: SessionSnapshot,
}

impl MetricsSnapshot {
    /// Single-line summary for periodic logging.
    pub fn to_log_line(&self) -> String {
        format!(
            "http.requests={} http.byMethod={:?} http.byStatus={:?} rpc.byMethod={:?} rpc.errors={:?} \
             sessions.created={} sessions.removed={} sessions.expired={} sse.opened={} sse.closed={} \
             sse.rejected={:?} sse.events={:?} {}",
            self.http_requests_total,
            self.http_requests_by_method,
            self.http_responses_by_status,
            self.rpc_calls_by_method,
            self.rpc_errors_by_code,
            self.sessions_created,
            self.sessions_removed,
            self.sessions_expired,
            self.sse_connections_opened,
            self.sse_connections_closed,
            self.sse_rejected_by_reason,
            self.sse_events_by_type,
            self.sessions.to_log_fragment()
        )
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        counter(
            &mut out,
            "codenav_http_requests_total",
            "Total HTTP requests",
            self.http_requests_total,
        );
        labeled(
            &mut out,
            "codenav_http_requests_by_method",
            "HTTP requests by method",
            "method",
            &self.http_requests_by_method,
        );
        labeled(
            &mut out,
            "codenav_http_responses_by_status",
            "HTTP responses by status",
            "status",
            &self.http_responses_by_status,
        );
        labeled(
            &mut out,
            "codenav_rpc_calls",
            "JSON-RPC calls by method",
            "method",
            &self.rpc_calls_by_method,
        );
        labeled(
            &mut out,
            "codenav_rpc_errors",
            "JSON-RPC errors by code",
            "code",
            &self.rpc_errors_by_code,
        );
        counter(&mut out, "codenav_sessions_created", "Sessions created", self.sessions_created);
        counter(&mut out, "codenav_sessions_removed", "Sessions removed", self.sessions_removed);
        counter(
            &mut out,
            "codenav_sessions_expired",
            "Sessions removed by expiry",
            self.sessions_expired,
        );
        counter(
            &mut out,
            "codenav_sse_connections_opened",
            "SSE streams opened",
            self.sse_connections_opened,
        );
        counter(
            &mut out,
            "codenav_sse_connections_closed",
            "SSE streams closed",
            self.sse_connections_closed,
        );
        labeled(
            &mut out,
            "codenav_sse_rejected",
            "SSE connections rejected by reason",
            "reason",
            &self.sse_rejected_by_reason,
        );
        labeled(
            &mut out,
            "codenav_sse_events",
            "SSE events sent by type",
            "type",
            &self.sse_events_by_type,
        );

        gauge(
            &mut out,
            "codenav_sessions_active",
            "Sessions in the table",
            self.sessions.total as u64,
        );
        gauge(
            &mut out,
            "codenav_sessions_stream_attached",
            "Sessions with an attached stream",
            self.sessions.stream_attached as u64,
        );
        gauge(
            &mut out,
            "codenav_sessions_queued_events",
            "Events waiting in session queues",
            self.sessions.queued_events as u64,
        );
        gauge(
            &mut out,
            "codenav_sessions_dropped_events",
            "Events dropped by live sessions",
            self.sessions.dropped_events,
        );

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(
        out,
        "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
        name, help, name, name, value
    );
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(
        out,
        "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
        name, help, name, name, value
    );
}

fn labeled<K: std::fmt::Display>(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: &BTreeMap<K, u64>,
) {
    let _ = writeln!(out, "# HELP {} {}\n# TYPE {} counter", name, help, name);
    for (key, value) in values {
        let key = escape_label_value(&key.to_string());
        let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", name, label, key, value);
    }
    out.push('\n');
}

/// Prometheus label escaping: backslash, double quote and newline.
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}
