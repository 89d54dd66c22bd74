//! Codenav MCP Server
//!
//! A Model Context Protocol server that exposes code navigation tools to
//! clients over HTTP. Requests arrive as JSON-RPC 2.0 on `POST /mcp`;
//! asynchronous events flow back over a per-session Server-Sent Events stream.
//!
//! # Architecture
//!
//! 1. **MCP Layer** (`mcp`) - Sessions, JSON-RPC dispatch, project routing, tool registry
//! 2. **Transport Layer** (`http`) - axum router, SSE streaming, server lifecycle
//! 3. **Tools Layer** (`tools`) - Built-in navigation tools
//! 4. **Support** (`config`, `error`, `metrics`)
//!
//! # Features
//!
//! - **Session-bound streams**: at most one SSE stream per session, with
//!   reconnect replay from a bounded history
//! - **Bounded queues**: producers never block; the oldest pending event is
//!   dropped when a session's queue is full
//! - **Expiry sweep**: idle sessions are closed on a fixed interval

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod tools;

pub use error::{Error, Result};

/// Server version reported by `initialize` and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
