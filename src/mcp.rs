//! MCP (Model Context Protocol) JSON-RPC handler.
//!
//! One [`McpHandler`] exists per session. It holds the negotiated protocol
//! state and turns each inbound JSON-RPC message into at most one response.
//! Transport concerns (HTTP, stdio, ordering) live in the callers.
//!
//! ## Supported methods
//!
//! | Method              | Description                      |
//! |---------------------|----------------------------------|
//! | `initialize`        | Handshake, returns capabilities  |
//! | `tools/list`        | List available tool definitions  |
//! | `tools/call`        | Execute a tool and return result |
//! | `ping`              | Liveness check                   |
//!
//! Notifications (`notifications/initialized`, `notifications/cancelled`) are
//! acknowledged silently. Responses sent by the client are ignored.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{
    jsonrpc_error, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, NOT_INITIALIZED,
    SESSION_ERROR,
};
use crate::tools::{ToolContext, ToolRegistry};
use crate::upstream::UpstreamClient;

pub const SERVER_NAME: &str = "ninjaone-mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol versions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Shared, process-wide dependencies every handler is bound to.
#[derive(Clone)]
pub struct HandlerContext {
    pub upstream: Arc<UpstreamClient>,
    pub tools: Arc<ToolRegistry>,
}

impl HandlerContext {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self {
            upstream,
            tools: Arc::new(ToolRegistry::builtin()),
        }
    }
}

/// Per-session protocol state machine.
pub struct McpHandler {
    ctx: HandlerContext,
    notifier: broadcast::Sender<Value>,
    /// Negotiated version, set by `initialize`.
    protocol_version: Option<String>,
    closed: bool,
}

/// Pick the version to answer `initialize` with.
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|s| **s == v))
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

impl McpHandler {
    /// `notifier` carries server-initiated messages to whoever listens on the
    /// session's push stream.
    pub fn new(ctx: HandlerContext, notifier: broadcast::Sender<Value>) -> Self {
        Self {
            ctx,
            notifier,
            protocol_version: None,
            closed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.protocol_version.is_some()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Refuse every further request.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Handle one JSON-RPC message. Returns `None` for notifications and
    /// client responses.
    pub async fn handle(&mut self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            if message.get("result").is_some() || message.get("error").is_some() {
                debug!("Ignoring client response for id {:?}", id);
                return None;
            }
            return id.map(|id| {
                jsonrpc_error(Some(id), INVALID_REQUEST, "Invalid request: missing method")
            });
        };

        // Notifications (no id): acknowledge silently
        let Some(id) = id else {
            match method {
                "notifications/initialized" | "notifications/cancelled" => {}
                _ => debug!("Unknown notification: {method}"),
            }
            return None;
        };

        if self.closed {
            return Some(jsonrpc_error(Some(id), SESSION_ERROR, "Session closed"));
        }

        let response = match method {
            "initialize" => self.handle_initialize(&message),
            "ping" => json!({ "jsonrpc": "2.0", "result": {} }),
            "tools/list" | "tools/call" if !self.is_initialized() => {
                jsonrpc_error(None, NOT_INITIALIZED, "Session not initialized")
            }
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "result": { "tools": self.ctx.tools.definitions() }
            }),
            "tools/call" => self.handle_tools_call(&message).await,
            _ => jsonrpc_error(None, METHOD_NOT_FOUND, format!("Method not found: {method}")),
        };

        Some(inject_id(response, id))
    }

    /// Handle `initialize`: negotiate the protocol version and return
    /// capabilities and server info.
    fn handle_initialize(&mut self, request: &Value) -> Value {
        let requested = request
            .pointer("/params/protocolVersion")
            .and_then(Value::as_str);
        let version = negotiate_version(requested);
        self.protocol_version = Some(version.to_string());
        debug!("Negotiated protocol version {version} (client asked {requested:?})");
        json!({
            "jsonrpc": "2.0",
            "result": {
                "protocolVersion": version,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "logging": {}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION
                }
            }
        })
    }

    /// Handle `tools/call`: dispatch through the tool registry.
    async fn handle_tools_call(&self, request: &Value) -> Value {
        let params = request.get("params").cloned().unwrap_or(json!({}));
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return jsonrpc_error(None, INVALID_PARAMS, "Missing tool name");
        };
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let ctx = ToolContext {
            upstream: &self.ctx.upstream,
            notifier: Some(&self.notifier),
        };
        let result = self.ctx.tools.call(name, &args, &ctx).await;
        if result.is_error {
            debug!("Tool {name} failed");
        }
        json!({
            "jsonrpc": "2.0",
            "result": result.to_json()
        })
    }
}

/// Inject the request `id` into a response object.
fn inject_id(mut response: Value, id: Value) -> Value {
    response["id"] = id;
    response
}
