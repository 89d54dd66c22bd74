//! Configuration management for the codenav server.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default listen address; only loopback or all-interfaces are accepted.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
/// Bind on every interface.
pub const BIND_ALL_ADDRESSES: &str = "0.0.0.0";
/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8765;

pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_HISTORY_SIZE: usize = 100;
pub const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 15_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1_048_576;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;

/// Command-line arguments for the codenav server.
#[derive(Parser, Debug, Clone)]
#[command(name = "codenav-mcp")]
#[command(author = "Codenav Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server exposing code navigation tools over JSON-RPC and SSE")]
pub struct Args {
    /// Project directories to register (repeatable or comma separated)
    #[arg(short = 'p', long = "project", env = "CODENAV_PROJECTS", value_delimiter = ',')]
    pub projects: Vec<PathBuf>,

    /// Listen address (127.0.0.1 or 0.0.0.0)
    #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS, env = "CODENAV_LISTEN_ADDRESS")]
    pub listen_address: String,

    /// HTTP port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "CODENAV_PORT")]
    pub port: u16,

    /// Enable debug logging
    #[arg(short, long, env = "CODENAV_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "CODENAV_LOG_JSON")]
    pub log_json: bool,

    /// Per-session event queue capacity
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE, env = "CODENAV_SSE_QUEUE_SIZE")]
    pub queue_size: usize,

    /// Idle minutes before a session expires
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_MINUTES, env = "CODENAV_SSE_SESSION_TIMEOUT")]
    pub session_timeout_minutes: u64,

    /// Minutes between expiry sweeps
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MINUTES, env = "CODENAV_SSE_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval_minutes: u64,

    /// Reconnect delay advertised to SSE clients (ms)
    #[arg(long, default_value_t = DEFAULT_RETRY_TIMEOUT_MS, env = "CODENAV_SSE_RETRY_TIMEOUT")]
    pub retry_timeout_ms: u64,

    /// Maximum accepted POST body size (bytes)
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES, env = "CODENAV_MAX_BODY_BYTES")]
    pub max_body_bytes: usize,
}

/// SSE session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseConfig {
    /// Pending events held per session before drop-oldest kicks in.
    pub queue_size: usize,
    /// Delivered events retained per session for reconnect replay.
    pub history_size: usize,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub retry_timeout_ms: u64,
    /// Longest queue wait before a keep-alive comment is due.
    pub keep_alive_ms: u64,
}

impl SseConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            history_size: DEFAULT_HISTORY_SIZE,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MINUTES * 60 * 1000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MINUTES * 60 * 1000,
            retry_timeout_ms: DEFAULT_RETRY_TIMEOUT_MS,
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Projects registered at startup
    pub projects: Vec<PathBuf>,
    /// Sanitized listen address
    pub listen_address: String,
    /// Sanitized port
    pub port: u16,
    /// Debug mode
    pub debug: bool,
    /// JSON log output
    pub log_json: bool,
    /// SSE session settings
    pub sse: SseConfig,
    /// POST body cap
    pub max_body_bytes: usize,
    /// Drain window on shutdown
    pub shutdown_grace_ms: u64,
}

impl Config {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Absolute, symlink-free roots for the startup projects.
    ///
    /// Every entry must be an existing directory.
    pub fn project_roots(&self) -> Result<Vec<PathBuf>> {
        self.projects
            .iter()
            .map(|project| {
                if !project.is_dir() {
                    return Err(Error::Config(format!(
                        "Project directory not found: {}",
                        project.display()
                    )));
                }
                project.canonicalize().map_err(|e| {
                    Error::Config(format!("Cannot resolve project {}: {}", project.display(), e))
                })
            })
            .collect()
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            projects: args.projects,
            listen_address: sanitize_address(Some(&args.listen_address)),
            port: sanitize_port(Some(args.port)),
            debug: args.debug,
            log_json: args.log_json,
            sse: SseConfig {
                queue_size: args.queue_size.max(1),
                history_size: DEFAULT_HISTORY_SIZE,
                session_timeout_ms: args.session_timeout_minutes.saturating_mul(60_000),
                heartbeat_interval_ms: args.heartbeat_interval_minutes.max(1).saturating_mul(60_000),
                retry_timeout_ms: args.retry_timeout_ms,
                keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            },
            max_body_bytes: args.max_body_bytes,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            debug: false,
            log_json: false,
            sse: SseConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

/// Coerce a listen address into the allowed set.
pub fn sanitize_address(value: Option<&str>) -> String {
    match value {
        Some(addr @ (DEFAULT_LISTEN_ADDRESS | BIND_ALL_ADDRESSES)) => addr.to_string(),
        _ => DEFAULT_LISTEN_ADDRESS.to_string(),
    }
}

/// Coerce a port into 1..=65535.
pub fn sanitize_port(value: Option<u16>) -> u16 {
    match value {
        Some(port) if port >= 1 => port,
        _ => DEFAULT_PORT,
    }
}
