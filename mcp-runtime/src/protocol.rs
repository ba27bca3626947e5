//! JSON-RPC 2.0 envelope helpers and the gateway's error taxonomy.

use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const AUTHENTICATION_REQUIRED: i64 = -32001;
    pub const AUTHENTICATION_FAILED: i64 = -32002;
    pub const BAD_CREDENTIALS: i64 = -32003;
    pub const TOOL_EXECUTION_ERROR: i64 = -32004;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    fn with_kind(code: i64, kind: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(json!({ "kind": kind })),
        }
    }

    /// Merges `extra` object fields into `data`, keeping `kind`.
    pub fn with_data(mut self, extra: Value) -> Self {
        let data = self.data.get_or_insert_with(|| json!({}));
        if let (Some(target), Value::Object(extra)) = (data.as_object_mut(), extra) {
            for (key, value) in extra {
                if key != "kind" {
                    target.insert(key, value);
                }
            }
        }
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("kind"))
            .and_then(Value::as_str)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::with_kind(codes::PARSE_ERROR, "parse_error", message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_kind(codes::INVALID_REQUEST, "invalid_request", message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_kind(
            codes::METHOD_NOT_FOUND,
            "method_not_found",
            format!("Method not found: {method}"),
        )
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::with_kind(
            codes::METHOD_NOT_FOUND,
            "method_not_found",
            format!("Unknown tool: {name}"),
        )
        .with_data(json!({ "tool": name }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_kind(codes::INVALID_PARAMS, "invalid_params", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_kind(codes::INTERNAL_ERROR, "internal_error", message)
    }

    /// Clients react to `requiresAuth` by calling `nextTool`.
    pub fn authentication_required(message: impl Into<String>) -> Self {
        Self::with_kind(
            codes::AUTHENTICATION_REQUIRED,
            "authentication_required",
            message,
        )
        .with_data(json!({ "requiresAuth": true, "nextTool": "authenticate" }))
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::with_kind(
            codes::AUTHENTICATION_FAILED,
            "authentication_failed",
            message,
        )
    }

    pub fn bad_credentials(message: impl Into<String>) -> Self {
        Self::with_kind(codes::BAD_CREDENTIALS, "bad_credentials", message)
    }

    pub fn tool_execution(message: impl Into<String>) -> Self {
        Self::with_kind(
            codes::TOOL_EXECUTION_ERROR,
            "tool_execution_error",
            message,
        )
    }
}

pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result
    })
}

pub fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

/// Parses a raw request body. Unparsable input becomes a ready-to-send
/// `ParseError` envelope with `id: null`.
pub fn parse_body(body: &[u8]) -> Result<Value, Value> {
    serde_json::from_slice::<Value>(body).map_err(|err| {
        error_response(
            Value::Null,
            RpcError::parse_error(format!("Request body is not valid JSON: {err}")),
        )
    })
}

/// Correlation ids may be strings, numbers or null.
pub fn is_valid_id(id: &Value) -> bool {
    matches!(id, Value::String(_) | Value::Number(_) | Value::Null)
}
