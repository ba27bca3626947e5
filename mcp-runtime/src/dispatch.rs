//! Protocol Adapter and Dispatcher.
//!
//! Turns raw JSON-RPC bodies into at most one response envelope per
//! request. Nothing that happens inside a single request (bad input,
//! upstream failure, even a panic in a handler) escapes as anything other
//! than an error envelope.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::args::ToolError;
use crate::protocol::{
    JSONRPC_VERSION, RpcError, error_response, is_valid_id, parse_body, success_response,
};
use crate::session::SessionManager;
use crate::tools::{self, AuthenticateArgs, ToolKind, ToolRegistry};
use crate::{MCP_PROTOCOL_VERSION, MCP_SERVER_NAME};

/// Transport-level facts the dispatcher needs about one inbound message.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Session id from correlation headers, if any were sent.
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    registry: ToolRegistry,
    sessions: SessionManager,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, sessions: SessionManager) -> Self {
        Self {
            inner: Arc::new(Inner { registry, sessions }),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Entry point for transports: parse, dispatch, collect responses.
    /// An empty result means the body held only notifications.
    pub async fn handle_body(&self, ctx: &RequestContext, body: &[u8]) -> Vec<Value> {
        match parse_body(body) {
            Ok(incoming) => self.handle_incoming_message(ctx, incoming).await,
            Err(envelope) => {
                debug!(event = "rpc_parse_error", bytes = body.len());
                vec![envelope]
            }
        }
    }

    pub async fn handle_incoming_message(&self, ctx: &RequestContext, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Value::Array(batch) = incoming {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(ctx, item).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(ctx, incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, ctx: &RequestContext, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        let id = obj.get("id").cloned();
        if let Some(id) = &id {
            if !is_valid_id(id) {
                return Some(error_response(
                    Value::Null,
                    RpcError::invalid_request("id must be a string, number or null"),
                ));
            }
        }

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let method = match obj.get("method") {
            Some(Value::String(method)) => method.clone(),
            Some(_) => {
                return Some(error_response(
                    id.unwrap_or(Value::Null),
                    RpcError::invalid_request("method must be a string"),
                ));
            }
            // A client answering a server-initiated request; there are none to match.
            None if obj.contains_key("result") || obj.contains_key("error") => return None,
            None => {
                return Some(error_response(
                    id.unwrap_or(Value::Null),
                    RpcError::invalid_request("Missing 'method'"),
                ));
            }
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        let Some(id) = id else {
            self.handle_notification(&method);
            return None;
        };

        let result = self.run_isolated(ctx, &method, params).await;
        Some(match result {
            Ok(payload) => success_response(id, payload),
            Err(err) => error_response(id, err),
        })
    }

    /// Runs one request on its own task so a panic in a handler is reported
    /// as `InternalError` instead of tearing down the caller.
    async fn run_isolated(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let this = self.clone();
        let ctx = ctx.clone();
        let method_owned = method.to_string();
        let task =
            tokio::spawn(async move { this.handle_request(&ctx, &method_owned, params).await });
        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(
                    event = "rpc_handler_crashed",
                    method = %method,
                    error = %join_err,
                    "request handler did not complete"
                );
                Err(RpcError::internal("Internal error while handling request"))
            }
        }
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" | "notifications/cancelled" => {}
            other => debug!(event = "rpc_notification_ignored", method = %other),
        }
    }

    async fn handle_request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(ctx, params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    pub fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Call 'authenticate' with your CRM api_key and account_id once per session, then use the CRM tools. Send an x-session-id (or x-thread-id / x-conversation-id) header to keep sessions apart."
        })
    }

    pub fn tools_list_payload(&self) -> Value {
        json!({ "tools": self.inner.registry.descriptors() })
    }

    async fn handle_tools_call(&self, ctx: &RequestContext, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let tool = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| RpcError::tool_not_found(name))?;

        let started = Instant::now();
        let result = self.call_tool(ctx, tool.kind, &args).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let session_id = ctx.session_id.as_deref().unwrap_or("-");
        match &result {
            Ok(_) => info!(
                event = "tool_call",
                tool = name,
                session_id,
                elapsed_ms,
                outcome = "ok"
            ),
            Err(err) => warn!(
                event = "tool_call",
                tool = name,
                session_id,
                elapsed_ms,
                outcome = err.kind().unwrap_or("error"),
                code = err.code,
                message = %err.message
            ),
        }
        result.map(build_tool_call_response)
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        kind: ToolKind,
        args: &Map<String, Value>,
    ) -> Result<Value, RpcError> {
        let sessions = &self.inner.sessions;
        let session_id = ctx.session_id.as_deref();
        match kind {
            ToolKind::Authenticate => {
                let parsed = AuthenticateArgs::parse(args).map_err(|err| {
                    RpcError::bad_credentials(err.message.clone()).with_data(err.to_value())
                })?;
                let outcome = sessions
                    .authenticate(session_id, &parsed.api_key, &parsed.account_id)
                    .await?;
                Ok(json!(outcome))
            }
            ToolKind::SessionStatus => Ok(json!(sessions.status(session_id))),
            _ => {
                let client = sessions.client_for(session_id)?;
                tools::execute(kind, &client, args)
                    .await
                    .map_err(tool_execution_error)
            }
        }
    }
}

fn tool_execution_error(err: ToolError) -> RpcError {
    RpcError::tool_execution(err.message.clone()).with_data(err.to_value())
}

fn build_tool_call_response(envelope: Value) -> Value {
    let text = serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| envelope.to_string());
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": envelope
    })
}
