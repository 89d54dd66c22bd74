//! JSON-RPC dispatch for the four supported MCP methods.
//!
//! Each request is handled independently; the only state carried between
//! requests is the session table.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::mcp::handler::{Arguments, ToolExecutor, ToolRegistry};
use crate::mcp::manager::SessionManager;
use crate::mcp::protocol::{
    error_codes, methods, InitializeResult, JsonRpcResponse, ListToolsResult, JSONRPC_VERSION,
    RESERVED_METHOD_PREFIX,
};
use crate::mcp::router::ProjectRouter;
use crate::mcp::session::Session;
use crate::metrics::Metrics;

/// Routes JSON-RPC envelopes to method handlers.
pub struct RpcDispatcher {
    router: Arc<dyn ProjectRouter>,
    sessions: Arc<SessionManager>,
    tools: Arc<dyn ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    metrics: Arc<Metrics>,
}

impl RpcDispatcher {
    pub fn new(
        router: Arc<dyn ProjectRouter>,
        sessions: Arc<SessionManager>,
        tools: Arc<dyn ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            router,
            sessions,
            tools,
            executor,
            metrics,
        }
    }

    /// Handle one request object.
    ///
    /// Returns `None` when no reply is due: notifications, and requests
    /// without an id.
    pub async fn handle_rpc(
        &self,
        request: &Map<String, Value>,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = request.get("id");
        if !is_valid_version(request.get("jsonrpc")) || !is_valid_request_id(id) {
            return Some(self.fail(Value::Null, error_codes::INVALID_REQUEST, "Invalid request"));
        }

        let method = request
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty() && !m.starts_with(RESERVED_METHOD_PREFIX));
        let Some(method) = method else {
            let reply_id = id.cloned().unwrap_or(Value::Null);
            return Some(self.fail(reply_id, error_codes::INVALID_REQUEST, "Invalid request"));
        };

        self.metrics.record_rpc_call(method);
        debug!("Handling RPC: {} (id: {:?})", method, id);

        match method {
            methods::INITIALIZE => self.handle_initialize(id, project_path_header),
            methods::INITIALIZED => {
                self.handle_initialized(id, session_header, project_path_header)
            }
            methods::TOOLS_LIST => self.handle_tools_list(id, session_header, project_path_header),
            methods::TOOLS_CALL => {
                self.handle_tools_call(id, request, session_header, project_path_header)
                    .await
            }
            other => id.map(|id| {
                self.fail(
                    id.clone(),
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", other),
                )
            }),
        }
    }

    fn handle_initialize(
        &self,
        id: Option<&Value>,
        project_path_header: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = id?;
        match self.router.resolve_project(project_path_header) {
            Err(e) if e.is_routing() => {
                Some(self.fail(id.clone(), error_codes::PROJECT_NOT_FOUND, e.to_string()))
            }
            Err(e) => {
                warn!("Project resolution failed: {}", e);
                Some(self.fail(id.clone(), error_codes::INTERNAL_ERROR, "Internal error"))
            }
            Ok(resolved) => {
                let session = self.sessions.create_session(&resolved.project_path);
                let result = InitializeResult::new(session.id());
                match serde_json::to_value(result) {
                    Ok(value) => Some(JsonRpcResponse::success(id.clone(), value)),
                    Err(e) => {
                        warn!("Failed to encode initialize result: {}", e);
                        Some(self.fail(id.clone(), error_codes::INTERNAL_ERROR, "Internal error"))
                    }
                }
            }
        }
    }

    fn handle_initialized(
        &self,
        id: Option<&Value>,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let session = match self.require_session(id, session_header, project_path_header) {
            Ok(session) => session,
            Err(reply) => return reply,
        };
        session.mark_initialized();
        None
    }

    fn handle_tools_list(
        &self,
        id: Option<&Value>,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = id?;
        let session = match self.require_ready_session(id, session_header, project_path_header) {
            Ok(session) => session,
            Err(reply) => return Some(reply),
        };
        session.touch();

        let result = ListToolsResult {
            tools: self.tools.list_tools().iter().map(|t| t.definition()).collect(),
        };
        match serde_json::to_value(result) {
            Ok(value) => Some(JsonRpcResponse::success(id.clone(), value)),
            Err(e) => {
                warn!("Failed to encode tool list: {}", e);
                Some(self.fail(id.clone(), error_codes::INTERNAL_ERROR, "Internal error"))
            }
        }
    }

    async fn handle_tools_call(
        &self,
        id: Option<&Value>,
        request: &Map<String, Value>,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = id?;
        let session = match self.require_ready_session(id, session_header, project_path_header) {
            Ok(session) => session,
            Err(reply) => return Some(reply),
        };

        let Some(params) = request.get("params").and_then(Value::as_object) else {
            return Some(self.fail(id.clone(), error_codes::INVALID_PARAMS, "Invalid params"));
        };
        let Some(name) = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
        else {
            return Some(self.fail(id.clone(), error_codes::INVALID_PARAMS, "Tool name missing"));
        };
        let arguments: Arguments = match params.get("arguments") {
            None => Arguments::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return Some(self.fail(id.clone(), error_codes::INVALID_PARAMS, "Invalid arguments"))
            }
        };

        let Some(workspace) = self.router.find_project_by_path(session.project_path()) else {
            return Some(self.fail(
                id.clone(),
                error_codes::PROJECT_NOT_FOUND,
                "No project registered",
            ));
        };

        match self.executor.execute(&workspace, name, arguments).await {
            Ok(result) => {
                session.touch();
                Some(JsonRpcResponse::success(id.clone(), result))
            }
            Err(e) => {
                warn!("Tool '{}' failed: {}", name, e);
                Some(self.fail(id.clone(), error_codes::INTERNAL_ERROR, "Internal error"))
            }
        }
    }

    /// Session lookup plus project check. On failure, yields the reply to
    /// send (nothing for notifications).
    fn require_session(
        &self,
        id: Option<&Value>,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Result<Arc<Session>, Option<JsonRpcResponse>> {
        let Some(session) = self.sessions.get_session(session_header) else {
            return Err(id.map(|id| {
                self.fail(id.clone(), error_codes::SESSION_NOT_FOUND, "Session not found")
            }));
        };
        if let Err(mismatch) = self
            .sessions
            .validate_project_path_header(project_path_header, &session)
        {
            return Err(id.map(|id| {
                self.fail(id.clone(), error_codes::PROJECT_MISMATCH, mismatch.to_string())
            }));
        }
        Ok(session)
    }

    /// [`require_session`](Self::require_session) plus the initialized check.
    fn require_ready_session(
        &self,
        id: &Value,
        session_header: Option<&str>,
        project_path_header: Option<&str>,
    ) -> Result<Arc<Session>, JsonRpcResponse> {
        let session = self
            .require_session(Some(id), session_header, project_path_header)
            .map_err(|reply| {
                reply.unwrap_or_else(|| {
                    self.fail(id.clone(), error_codes::INTERNAL_ERROR, "Internal error")
                })
            })?;
        if !session.is_initialized() {
            return Err(self.fail(
                id.clone(),
                error_codes::SESSION_NOT_INITIALIZED,
                "Session not initialized",
            ));
        }
        Ok(session)
    }

    fn fail(&self, id: Value, code: i32, message: impl Into<String>) -> JsonRpcResponse {
        self.metrics.record_rpc_error(code);
        JsonRpcResponse::error(id, code, message)
    }
}

fn is_valid_version(version: Option<&Value>) -> bool {
    version.and_then(Value::as_str) == Some(JSONRPC_VERSION)
}

/// Ids may be absent, null, a string or a number.
fn is_valid_request_id(id: Option<&Value>) -> bool {
    matches!(
        id,
        None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_))
    )
}

/// Standalone error body for failures detected before dispatch.
pub fn error_body(code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": Value::Null,
        "error": { "code": code, "message": message }
    })
}
