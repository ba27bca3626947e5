use std::convert::Infallible;

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use crm_gateway_mcp_runtime::RequestContext;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use super::mcp_http::{body_rejection_response, session_from_headers};
use crate::error::AppError;
use crate::push::{MESSAGES_PATH, PushMessage, PushTimings};
use crate::state::AppState;

pub const SSE_PATH: &str = "/sse";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(SSE_PATH, post(sse_post).get(open_push_channel))
        .route(MESSAGES_PATH, post(post_message))
}

/// Single-shot SSE: the envelope goes out as one `message` event and the
/// stream ends.
async fn sse_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return body_rejection_response(&rejection, state.transport.max_body_bytes),
    };

    let ctx = RequestContext {
        session_id: session_from_headers(&headers),
    };
    let mut responses = state.dispatcher.handle_body(&ctx, &body).await;

    let envelope = match responses.len() {
        0 => return StatusCode::ACCEPTED.into_response(),
        1 => responses.remove(0),
        _ => serde_json::Value::Array(responses),
    };
    let event = PushMessage::Response(envelope).into_event();
    Sse::new(tokio_stream::once(Ok::<Event, Infallible>(event))).into_response()
}

async fn open_push_channel(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = session_from_headers(&headers);
    let timings = PushTimings {
        heartbeat: state.transport.push_heartbeat,
        max_lifetime: state.transport.push_max_lifetime,
    };
    let channel = state.channels.open(
        session_id.clone(),
        state.dispatcher.registry().len(),
        timings,
        state.shutdown.child_token(),
    );
    info!(
        event = "push_channel_opened",
        connection_id = %channel.id,
        session_id = session_id.as_deref().unwrap_or("-"),
        "push channel opened"
    );

    let stream = ReceiverStream::new(channel.receiver)
        .map(|message| Ok::<Event, Infallible>(message.into_event()));
    Sse::new(stream).into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    connection_id: Option<String>,
}

/// Dispatches in the background and answers 202; responses arrive as
/// `message` events on the channel.
async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let raw_id = query.connection_id.ok_or_else(|| AppError::Validation {
        message: "connection_id query parameter is required".to_string(),
        field: Some("connection_id".to_string()),
        docs_hint: Some("Use the path announced by the 'endpoint' event of GET /sse.".to_string()),
    })?;
    let connection_id = Uuid::parse_str(raw_id.trim()).map_err(|_| AppError::Validation {
        message: format!("'{raw_id}' is not a valid connection id"),
        field: Some("connection_id".to_string()),
        docs_hint: None,
    })?;

    let captured = state
        .channels
        .session_id(&connection_id)
        .ok_or_else(|| AppError::NotFound {
            message: format!("Push channel {connection_id} is not open"),
            docs_hint: Some("Open a new channel with GET /sse.".to_string()),
        })?;

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return Ok(body_rejection_response(
                &rejection,
                state.transport.max_body_bytes,
            ));
        }
    };

    let ctx = RequestContext {
        session_id: session_from_headers(&headers).or(captured),
    };
    let dispatcher = state.dispatcher.clone();
    let channels = state.channels.clone();
    tokio::spawn(async move {
        let responses = dispatcher.handle_body(&ctx, &body).await;
        for envelope in responses {
            if !channels
                .deliver(&connection_id, PushMessage::Response(envelope))
                .await
            {
                warn!(
                    event = "push_delivery_failed",
                    connection_id = %connection_id,
                    "push channel closed before the response was delivered"
                );
                break;
            }
        }
    });

    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, BodyDataStream};
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    use crate::config::TransportConfig;
    use crate::routes::test_support::{TestGateway, json_body, post_json, post_json_with_headers};

    fn short_lived(heartbeat_ms: u64, lifetime_ms: u64) -> TransportConfig {
        TransportConfig {
            max_body_bytes: 4096,
            push_heartbeat: Duration::from_millis(heartbeat_ms),
            push_max_lifetime: Duration::from_millis(lifetime_ms),
        }
    }

    fn open_request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/sse");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request should build")
    }

    async fn read_until(stream: &mut BodyDataStream, buffer: &mut String, needle: &str) {
        let read = async {
            while !buffer.contains(needle) {
                match stream.next().await {
                    Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                    _ => break,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("stream should produce the expected event");
        assert!(buffer.contains(needle), "stream ended before '{needle}'");
    }

    fn connection_id(buffer: &str) -> String {
        let start = buffer
            .find("connection_id=")
            .expect("endpoint event carries the connection id")
            + "connection_id=".len();
        buffer[start..start + 36].to_string()
    }

    #[tokio::test]
    async fn push_channel_emits_lifecycle_events_in_order() {
        let gateway = TestGateway::with_transport(short_lived(40, 250)).await;
        let response = gateway
            .app
            .oneshot(open_request(&[]))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .expect("content-type header should exist"),
            "text/event-stream"
        );

        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream should end at max lifetime")
        .expect("body should read");
        let text = String::from_utf8_lossy(&bytes);

        let endpoint = text.find("event: endpoint").expect("endpoint event");
        let connection = text.find("event: connection").expect("connection event");
        let ping = text.find("event: ping").expect("heartbeat event");
        let close = text.find("event: close").expect("close event");
        assert!(endpoint < connection && connection < ping && ping < close);
        assert!(text.contains("data: /messages?connection_id="));
        assert!(text.contains(r#""reason":"max_lifetime""#));
        assert!(text.contains(r#""tools":7"#));
        assert_eq!(gateway.state.channels.len(), 0);
    }

    #[tokio::test]
    async fn posted_messages_are_answered_on_the_channel() {
        let gateway = TestGateway::with_transport(short_lived(1_000, 5_000)).await;
        let response = gateway
            .app
            .clone()
            .oneshot(open_request(&[]))
            .await
            .expect("request should succeed");
        let mut stream = response.into_body().into_data_stream();
        let mut buffer = String::new();
        read_until(&mut stream, &mut buffer, "event: connection").await;
        let id = connection_id(&buffer);

        let response = gateway
            .app
            .clone()
            .oneshot(post_json(
                &format!("/messages?connection_id={id}"),
                json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}),
            ))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        read_until(&mut stream, &mut buffer, r#""id":7"#).await;
        assert!(buffer.contains("event: message"));
        assert!(buffer.contains("search_contacts"));
    }

    #[tokio::test]
    async fn session_captured_at_open_is_used_for_header_less_posts() {
        let gateway = TestGateway::with_transport(short_lived(1_000, 5_000)).await;
        let auth = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {
                "name": "authenticate",
                "arguments": {"apiKey": gateway.crm.accepted_key, "locationId": "loc-9"}
            }
        });
        let response = gateway
            .app
            .clone()
            .oneshot(post_json_with_headers("/mcp", auth, &[("x-session-id", "push-session")]))
            .await
            .expect("request should succeed");
        assert_eq!(json_body(response).await["result"]["structuredContent"]["success"], true);

        let response = gateway
            .app
            .clone()
            .oneshot(open_request(&[("x-session-id", "push-session")]))
            .await
            .expect("request should succeed");
        let mut stream = response.into_body().into_data_stream();
        let mut buffer = String::new();
        read_until(&mut stream, &mut buffer, "event: connection").await;
        let id = connection_id(&buffer);

        let search = json!({
            "jsonrpc": "2.0",
            "id": "search-1",
            "method": "tools/call",
            "params": {"name": "search_contacts", "arguments": {"query": "jane"}}
        });
        let response = gateway
            .app
            .clone()
            .oneshot(post_json(&format!("/messages?connection_id={id}"), search))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        read_until(&mut stream, &mut buffer, r#""id":"search-1""#).await;
        assert!(buffer.contains(r#""success":true"#));
        assert!(!buffer.contains("-32001"));
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .oneshot(post_json(
                &format!("/messages?connection_id={}", uuid::Uuid::now_v7()),
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "not_found");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn malformed_connection_id_is_a_validation_error() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .clone()
            .oneshot(post_json(
                "/messages?connection_id=not-a-uuid",
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["field"], "connection_id");

        let response = gateway
            .app
            .oneshot(post_json(
                "/messages",
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_shot_sse_carries_one_message_event() {
        let gateway = TestGateway::start().await;
        let response = gateway
            .app
            .oneshot(post_json(
                "/sse",
                json!({"jsonrpc": "2.0", "id": 3, "method": "initialize", "params": {}}),
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("event: message").count(), 1);
        assert!(text.contains("2024-11-05"));
    }
}
