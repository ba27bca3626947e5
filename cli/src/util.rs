use crm_gateway_mcp_runtime::protocol::JSONRPC_VERSION;
use crm_gateway_mcp_runtime::session::SESSION_HEADERS;
use serde_json::{Map, Value, json};
use url::Url;

/// Exit codes: 0=success, 1=transport or usage error, 2=RPC error or failed step
pub const EXIT_OK: i32 = 0;
pub const EXIT_TRANSPORT: i32 = 1;
pub const EXIT_RPC: i32 = 2;

const CONNECTION_HINT: &str = "Is the gateway running? Check CRM_GATEWAY_URL.";

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn print_error(error: &str, message: &str, docs_hint: Option<&str>) {
    let mut err = json!({
        "error": error,
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", to_pretty_json(&err));
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    print_error("cli_error", message, docs_hint);
    std::process::exit(EXIT_TRANSPORT);
}

/// Parses `--args` into a JSON object; absent means `{}`.
pub fn parse_arguments(raw: Option<&str>) -> Result<Map<String, Value>, String> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("--args must be a JSON object".to_string()),
        Err(e) => Err(format!("Invalid JSON in --args: {e}")),
    }
}

/// Splits an envelope into its result or its error object.
pub fn rpc_outcome(envelope: &Value) -> Result<&Value, &Value> {
    match envelope.get("error") {
        Some(error) => Err(error),
        None => Ok(envelope.get("result").unwrap_or(&Value::Null)),
    }
}

/// Thin client for one gateway: REST views plus JSON-RPC over `/mcp`.
pub struct GatewayClient {
    base: Url,
    session_id: Option<String>,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(gateway_url: &str, session_id: Option<String>) -> Result<Self, String> {
        let base = Url::parse(gateway_url.trim())
            .map_err(|e| format!("Invalid gateway URL '{gateway_url}': {e}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(format!(
                "Invalid gateway URL '{gateway_url}': scheme must be http or https"
            ));
        }
        Ok(Self {
            base,
            session_id: session_id.filter(|id| !id.trim().is_empty()),
            http: client(),
        })
    }

    pub fn url(&self, path: &str) -> Result<Url, String> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| format!("Invalid path '{path}': {e}"))
    }

    /// GET a REST view; non-JSON bodies come back as `{raw_error}`.
    pub async fn get_json(&self, path: &str) -> Result<(u16, Value), String> {
        let resp = self
            .http
            .get(self.url(path)?)
            .send()
            .await
            .map_err(|e| format!("{e}"))?;
        let status = resp.status().as_u16();
        let body = resp
            .json()
            .await
            .unwrap_or_else(|e| json!({"raw_error": format!("Failed to parse response as JSON: {e}")}));
        Ok((status, body))
    }

    /// Sends one JSON-RPC request and returns the response envelope.
    pub async fn rpc(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": uuid::Uuid::now_v7().to_string(),
            "method": method,
            "params": params
        });
        let mut req = self.http.post(self.url("/mcp")?).json(&body);
        if let Some(session_id) = &self.session_id {
            // x-session-id is the explicit (lowest priority) correlation header
            req = req.header(SESSION_HEADERS[2], session_id.as_str());
        }
        let resp = req.send().await.map_err(|e| format!("{e}"))?;
        let status = resp.status();
        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| format!("Gateway answered {status} without a JSON-RPC envelope: {e}"))?;
        Ok(envelope)
    }

    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, String> {
        self.rpc(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }
}

/// Prints an envelope's result (stdout) or error (stderr) and maps it to an exit code.
pub fn report_envelope(envelope: &Value) -> i32 {
    match rpc_outcome(envelope) {
        Ok(result) => {
            println!("{}", to_pretty_json(result));
            EXIT_OK
        }
        Err(error) => {
            eprintln!("{}", to_pretty_json(error));
            EXIT_RPC
        }
    }
}

pub fn report_transport_error(message: &str) -> i32 {
    print_error("connection_error", message, Some(CONNECTION_HINT));
    EXIT_TRANSPORT
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn arguments_must_be_an_object() {
        assert!(parse_arguments(None).expect("absent is empty").is_empty());
        let args = parse_arguments(Some(r#"{"query": "jane"}"#)).expect("object parses");
        assert_eq!(args["query"], "jane");
        assert!(parse_arguments(Some("[1, 2]")).is_err());
        assert!(
            parse_arguments(Some("{oops"))
                .expect_err("invalid JSON is rejected")
                .contains("Invalid JSON")
        );
    }

    #[test]
    fn outcome_splits_result_and_error() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert_eq!(rpc_outcome(&ok), Ok(&json!({"tools": []})));
        let err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32001}});
        assert_eq!(rpc_outcome(&err), Err(&json!({"code": -32001})));
    }

    #[test]
    fn client_rejects_non_http_urls_and_blank_sessions() {
        assert!(GatewayClient::new("ftp://gateway.example", None).is_err());
        assert!(GatewayClient::new("not a url", None).is_err());
        let client = GatewayClient::new("http://gateway.example/base/", Some("  ".to_string()))
            .expect("valid URL");
        assert_eq!(client.session_id, None);
        assert_eq!(
            client.url("/mcp").expect("joins").as_str(),
            "http://gateway.example/base/mcp"
        );
    }

    #[tokio::test]
    async fn rpc_sends_the_session_header() {
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/mcp",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap_or_else(|e| e.into_inner()) = headers
                        .get("x-session-id")
                        .and_then(|v| v.to_str().ok())
                        .map(ToOwned::to_owned);
                    Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": {"method": body["method"]}}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = GatewayClient::new(&format!("http://{addr}"), Some("ops-1".to_string()))
            .expect("valid URL");
        let envelope = client.rpc("tools/list", json!({})).await.expect("rpc succeeds");
        assert_eq!(envelope["result"]["method"], "tools/list");
        assert_eq!(
            seen.lock().unwrap_or_else(|e| e.into_inner()).as_deref(),
            Some("ops-1")
        );
        server.abort();
    }
}
