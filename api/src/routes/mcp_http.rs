use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use crm_gateway_core::error::codes;
use crm_gateway_mcp_runtime::protocol::error_response;
use crm_gateway_mcp_runtime::session::resolve_session_id;
use crm_gateway_mcp_runtime::{RequestContext, RpcError};
use serde_json::{Value, json};
use tracing::warn;

use crate::state::AppState;

pub const MCP_PATH: &str = "/mcp";

pub fn router() -> Router<AppState> {
    Router::new().route(MCP_PATH, post(mcp_post))
}

async fn mcp_post(
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
    let responses = state.dispatcher.handle_body(&ctx, &body).await;

    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    if responses.len() == 1 {
        return (
            StatusCode::OK,
            Json(responses.into_iter().next().unwrap_or(Value::Null)),
        )
            .into_response();
    }

    (StatusCode::OK, Json(Value::Array(responses))).into_response()
}

/// Session id from correlation headers only; the session manager applies
/// any single-tenant fallback.
pub(crate) fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    resolve_session_id(
        |name| headers.get(name).and_then(|value| value.to_str().ok()),
        None,
    )
}

/// Envelope for a body that could not be read: 413 when it exceeded the
/// limit, 400 otherwise. The id is always null since nothing was parsed.
pub(crate) fn body_rejection_response(rejection: &BytesRejection, limit: usize) -> Response {
    let status = rejection.status();
    let error = if status == StatusCode::PAYLOAD_TOO_LARGE {
        RpcError::invalid_request(format!("Request body exceeds {limit} bytes")).with_data(json!({
            "error": codes::PAYLOAD_TOO_LARGE,
            "limit": limit
        }))
    } else {
        RpcError::invalid_request(format!(
            "Failed to read request body: {}",
            rejection.body_text()
        ))
    };
    warn!(
        event = "rpc_body_rejected",
        status = status.as_u16(),
        limit,
        "rejected request body"
    );
    (status, Json(error_response(Value::Null, error))).into_response()
}
