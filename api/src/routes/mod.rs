pub mod health;
pub mod mcp_http;
pub mod sse;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::middleware;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "CRM Gateway",
        description = "REST views of a session-authenticated MCP gateway in front of the CRM API. Tool calls themselves go through JSON-RPC on /mcp, /sse and /messages."
    ),
    paths(health::health_check, health::list_tools, health::index),
    components(schemas(
        health::HealthResponse,
        health::ToolSummary,
        health::ToolsResponse,
        health::EndpointInfo,
        health::IndexResponse,
        crm_gateway_core::error::ApiError,
    ))
)]
pub struct ApiDoc;

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub cors_origins: Vec<String>,
    pub rate_limit: bool,
}

/// The full HTTP surface: RPC transports (body-limited, optionally rate
/// limited), REST views and the OpenAPI document.
pub fn build_app(state: AppState, options: &RouterOptions) -> Router {
    let mut rpc = mcp_http::router()
        .merge(sse::router())
        .layer(DefaultBodyLimit::max(state.transport.max_body_bytes));
    if options.rate_limit {
        match middleware::rate_limit::rpc_layer() {
            Some(layer) => rpc = rpc.layer(layer),
            None => tracing::warn!("invalid rate limit config, RPC endpoints are not rate limited"),
        }
    }

    Router::new()
        .merge(health::router())
        .merge(rpc)
        .route("/api-doc/openapi.json", get(openapi_document))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors::build_cors_layer(&options.cors_origins))
                .layer(axum::middleware::from_fn(middleware::security_headers::apply)),
        )
        .with_state(state)
}

async fn openapi_document() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use crm_gateway_core::clock::SystemClock;
    use crm_gateway_mcp_runtime::testing::{StubCrm, StubOptions};
    use crm_gateway_mcp_runtime::{CrmConfig, RuntimeConfig};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use super::{RouterOptions, build_app};
    use crate::config::TransportConfig;
    use crate::state::AppState;

    /// Gateway wired to a stub CRM, with rate limiting off (oneshot
    /// requests carry no peer address).
    pub struct TestGateway {
        pub app: Router,
        pub state: AppState,
        pub crm: StubCrm,
    }

    impl TestGateway {
        pub async fn start() -> Self {
            Self::with_transport(TransportConfig {
                max_body_bytes: 4096,
                push_heartbeat: Duration::from_secs(1),
                push_max_lifetime: Duration::from_secs(5),
            })
            .await
        }

        pub async fn with_transport(transport: TransportConfig) -> Self {
            let crm = StubCrm::start(StubOptions::default()).await;
            let runtime = RuntimeConfig {
                crm: CrmConfig {
                    base_url: crm.base_url.clone(),
                    ..Default::default()
                },
                ..Default::default()
            };
            let dispatcher = runtime
                .build_dispatcher(Arc::new(SystemClock))
                .expect("stub runtime should build");
            let state = AppState::new(dispatcher, transport, CancellationToken::new());
            let app = build_app(
                state.clone(),
                &RouterOptions {
                    cors_origins: vec!["*".to_string()],
                    rate_limit: false,
                },
            );
            Self { app, state, crm }
        }
    }

    pub fn post_json(uri: &str, body: Value) -> Request<Body> {
        post_json_with_headers(uri, body, &[])
    }

    pub fn post_json_with_headers(uri: &str, body: Value, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    pub async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }
}
