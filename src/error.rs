//! Error types for the codenav MCP server.

use thiserror::Error;

/// Result type alias for codenav operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the server.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Project Routing Errors =====
    #[error("No project registered")]
    NoProjectRegistered,

    #[error("Unknown PROJECT_PATH")]
    UnknownProjectPath,

    #[error("PROJECT_PATH header is required when multiple projects are open")]
    ProjectPathRequired,

    #[error("Invalid project path: {0}")]
    InvalidProjectPath(String),

    // ===== Tool Errors =====
    #[error("Invalid tool registration: {0}")]
    InvalidToolRegistration(String),

    #[error(
        "Tool contract mismatch for id '{0}'. Additive expansion must not change existing tool contract."
    )]
    ToolContractMismatch(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    // ===== Transport Errors =====
    #[error("HTTP server error: {0}")]
    HttpServer(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if this error is a project routing failure.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::NoProjectRegistered
                | Self::UnknownProjectPath
                | Self::ProjectPathRequired
                | Self::InvalidProjectPath(_)
        )
    }

    /// Check if this error means the SSE peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WriteZero
            ),
            _ => false,
        }
    }
}
