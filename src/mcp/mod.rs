//! Model Context Protocol (MCP) session core.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC envelopes, MCP result types and error codes
//! - `session` - Per-client state: flags, event queue, replay history
//! - `manager` - Concurrent session table and expiry sweep
//! - `router` - `PROJECT_PATH` to workspace resolution
//! - `handler` - Tool registry and executor
//! - `dispatcher` - JSON-RPC method dispatch

pub mod dispatcher;
pub mod handler;
pub mod manager;
pub mod protocol;
pub mod router;
pub mod session;

pub use dispatcher::RpcDispatcher;
pub use handler::{DefaultToolExecutor, InMemoryToolRegistry, ToolExecutor, ToolRegistry};
pub use manager::SessionManager;
pub use router::{ProjectRouter, Workspace, WorkspaceRegistry};
pub use session::{QueuedEvent, Session};
