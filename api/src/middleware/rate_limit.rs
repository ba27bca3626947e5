use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

pub type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

/// Rate limit for the RPC endpoints (`/mcp`, `/sse`, `/messages`):
/// 120 requests/minute per client IP with a burst of 60.
pub fn rpc_layer() -> Option<RateLimitLayer> {
    per_ip_layer(500, 60)
}

fn per_ip_layer(replenish_every_ms: u64, burst: u32) -> Option<RateLimitLayer> {
    let config = GovernorConfigBuilder::default()
        .per_millisecond(replenish_every_ms)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()?;
    Some(GovernorLayer::new(config).error_handler(json_error_handler))
}

/// Renders rejections in the `ApiError` shape with a `Retry-After` header.
fn json_error_handler(err: GovernorError) -> Response<axum::body::Body> {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => (code, None, msg.unwrap_or_default()),
    };

    let body = serde_json::json!({
        "error": crm_gateway_core::error::codes::RATE_LIMITED,
        "message": message,
        "request_id": uuid::Uuid::now_v7().to_string(),
    });

    let mut response = (status, Json(body)).into_response();
    if let Some(seconds) = retry_after {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::post;
    use tower::ServiceExt;

    use super::per_ip_layer;

    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    fn from_ip(ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .expect("request should build")
    }

    #[tokio::test]
    async fn burst_exhaustion_is_rejected_with_api_error_body() {
        let layer = per_ip_layer(60_000, 2).expect("config should be valid");
        let app = Router::new().route("/mcp", post(ok)).layer(layer);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(from_ip("203.0.113.7"))
                .await
                .expect("request should succeed");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(from_ip("203.0.113.7"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["error"], "rate_limited");

        let response = app
            .oneshot(from_ip("198.51.100.9"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn zero_burst_is_not_a_valid_config() {
        assert!(per_ip_layer(500, 0).is_none());
    }
}
