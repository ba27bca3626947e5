use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use crm_gateway_mcp_runtime::{MCP_PROTOCOL_VERSION, MCP_SERVER_NAME};
use serde::Serialize;

use crate::state::AppState;

/// Credentials live only in process memory.
const STORAGE_MODE: &str = "session-memory";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/tools", get(list_tools))
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub active_sessions: usize,
    pub available_tools: usize,
    pub open_push_channels: usize,
    pub version: String,
}

/// Liveness plus a snapshot of gateway state
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Gateway is running", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        mode: STORAGE_MODE.to_string(),
        active_sessions: state.dispatcher.sessions().active_sessions(),
        available_tools: state.dispatcher.registry().len(),
        open_push_channels: state.channels.len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub requires_auth: bool,
    pub input_schema: serde_json::Value,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ToolsResponse {
    pub tools: Vec<ToolSummary>,
    pub count: usize,
}

/// Tool catalog as a REST view, including which tools need a session
#[utoipa::path(
    get,
    path = "/tools",
    responses(
        (status = 200, description = "Registered tools", body = ToolsResponse)
    ),
    tag = "tools"
)]
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let tools: Vec<ToolSummary> = state
        .dispatcher
        .registry()
        .descriptors()
        .iter()
        .map(|tool| ToolSummary {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            requires_auth: tool.requires_auth,
            input_schema: tool.input_schema.clone(),
        })
        .collect();
    let count = tools.len();
    Json(ToolsResponse { tools, count })
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct EndpointInfo {
    pub method: String,
    pub path: String,
    pub description: String,
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub endpoints: Vec<EndpointInfo>,
    pub tools: Vec<String>,
}

const ENDPOINTS: [(&str, &str, &str); 8] = [
    ("POST", "/mcp", "JSON-RPC over HTTP"),
    ("POST", "/sse", "JSON-RPC answered as a single SSE message event"),
    ("GET", "/sse", "Push channel for responses to /messages posts"),
    ("POST", "/messages?connection_id=<id>", "JSON-RPC delivered on a push channel"),
    ("GET", "/health", "Gateway health"),
    ("GET", "/tools", "Tool catalog"),
    ("GET", "/api-doc/openapi.json", "OpenAPI document for the REST views"),
    ("GET", "/", "This document"),
];

/// Index document naming the endpoints and tools
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Gateway index", body = IndexResponse)
    ),
    tag = "system"
)]
pub async fn index(State(state): State<AppState>) -> Json<IndexResponse> {
    Json(IndexResponse {
        name: MCP_SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        endpoints: ENDPOINTS
            .iter()
            .map(|(method, path, description)| EndpointInfo {
                method: method.to_string(),
                path: path.to_string(),
                description: description.to_string(),
            })
            .collect(),
        tools: state
            .dispatcher
            .registry()
            .names()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::routes::test_support::{TestGateway, json_body};

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request should build")
    }

    #[tokio::test]
    async fn health_reports_sessions_and_tools() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .oneshot(get("/health"))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["mode"], "session-memory");
        assert_eq!(body["activeSessions"], 0);
        assert_eq!(body["availableTools"], 7);
        assert_eq!(body["openPushChannels"], 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn tools_view_exposes_auth_requirements() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .oneshot(get("/tools"))
            .await
            .expect("request should succeed");

        let body = json_body(response).await;
        assert_eq!(body["count"], 7);
        let tools = body["tools"].as_array().expect("tools array");
        let auth = tools
            .iter()
            .find(|tool| tool["name"] == "authenticate")
            .expect("authenticate is listed");
        assert_eq!(auth["requiresAuth"], false);
        let search = tools
            .iter()
            .find(|tool| tool["name"] == "search_contacts")
            .expect("search_contacts is listed");
        assert_eq!(search["requiresAuth"], true);
        assert_eq!(search["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn index_lists_endpoints_and_tool_names() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .oneshot(get("/"))
            .await
            .expect("request should succeed");

        let body = json_body(response).await;
        assert_eq!(body["name"], "crm-gateway");
        assert_eq!(body["protocolVersion"], "2024-11-05");
        assert!(
            body["endpoints"]
                .as_array()
                .expect("endpoints array")
                .iter()
                .any(|endpoint| endpoint["path"] == "/mcp")
        );
        assert!(
            body["tools"]
                .as_array()
                .expect("tools array")
                .iter()
                .any(|name| name == "create_blog_post")
        );
    }
}
