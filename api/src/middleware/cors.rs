use axum::http::{HeaderName, HeaderValue, Method};
use crm_gateway_mcp_runtime::session::SESSION_HEADERS;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Build the CORS layer from the configured origin list.
///
/// - Origins: `*` (or an empty list) allows any origin; otherwise only the listed ones
/// - Methods: GET, POST, OPTIONS
/// - Headers: Content-Type, Authorization and the session correlation headers
/// - Max age: 3600s
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        AllowOrigin::list(values)
    };

    let mut headers = vec![
        HeaderName::from_static("content-type"),
        HeaderName::from_static("authorization"),
    ];
    headers.extend(SESSION_HEADERS.into_iter().map(HeaderName::from_static));

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(headers)
        .max_age(std::time::Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use tower::ServiceExt;

    use super::build_cors_layer;

    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method("OPTIONS")
            .uri("/mcp")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type,x-thread-id")
            .body(Body::empty())
            .expect("request should build")
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin_and_session_headers() {
        let app = Router::new()
            .route("/mcp", post(ok))
            .layer(build_cors_layer(&["*".to_string()]));

        let response = app
            .oneshot(preflight("https://agent.example"))
            .await
            .expect("request should succeed");

        let headers = response.headers();
        assert_eq!(
            headers
                .get("access-control-allow-origin")
                .expect("allow-origin header should exist"),
            "*"
        );
        let allowed = headers
            .get("access-control-allow-headers")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(allowed.contains("x-thread-id"));
        assert!(allowed.contains("x-session-id"));
    }

    #[tokio::test]
    async fn explicit_list_rejects_other_origins() {
        let app = Router::new()
            .route("/mcp", post(ok))
            .layer(build_cors_layer(&["https://allowed.example".to_string()]));

        let response = app
            .clone()
            .oneshot(preflight("https://allowed.example"))
            .await
            .expect("request should succeed");
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .expect("allow-origin header should exist"),
            "https://allowed.example"
        );

        let response = app
            .oneshot(preflight("https://other.example"))
            .await
            .expect("request should succeed");
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
