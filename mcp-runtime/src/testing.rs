//! Stub CRM API for tests: a real HTTP server on 127.0.0.1 that mimics
//! the handful of upstream endpoints the gateway calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub const STUB_ACCEPTED_KEY: &str = "valid-key";

#[derive(Debug, Clone)]
pub struct StubOptions {
    pub accepted_key: String,
    /// Delay applied to contact searches, for timeout tests.
    pub search_delay: Option<Duration>,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            accepted_key: STUB_ACCEPTED_KEY.to_string(),
            search_delay: None,
        }
    }
}

#[derive(Default)]
struct StubState {
    accepted_key: String,
    search_delay: Option<Duration>,
    probes: AtomicUsize,
    calls: AtomicUsize,
    last_body: Mutex<Option<Value>>,
    last_query: Mutex<Option<HashMap<String, String>>>,
}

impl StubState {
    fn check_headers(&self, headers: &HeaderMap) -> Result<(), Response> {
        if headers.get("version").is_none() {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "statusCode": 400, "message": "Version header was not found" })),
            )
                .into_response());
        }
        let expected = format!("Bearer {}", self.accepted_key);
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected);
        if !authorized {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "statusCode": 401, "message": "Invalid JWT" })),
            )
                .into_response());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn record_body(&self, body: &Value) {
        *self.last_body.lock().unwrap_or_else(|e| e.into_inner()) = Some(body.clone());
    }

    fn record_query(&self, query: &HashMap<String, String>) {
        *self.last_query.lock().unwrap_or_else(|e| e.into_inner()) = Some(query.clone());
    }
}

/// Running stub server; aborted on drop.
pub struct StubCrm {
    pub base_url: String,
    pub accepted_key: String,
    state: Arc<StubState>,
    handle: JoinHandle<()>,
}

impl StubCrm {
    pub async fn start(options: StubOptions) -> Self {
        let state = Arc::new(StubState {
            accepted_key: options.accepted_key.clone(),
            search_delay: options.search_delay,
            ..Default::default()
        });
        let app = Router::new()
            .route("/locations/{id}", get(location))
            .route("/contacts/", get(search_contacts).post(create_contact))
            .route("/conversations/messages", post(send_message))
            .route("/blogs/", post(create_blog))
            .route("/opportunities/search", get(search_opportunities))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub CRM listener");
        let addr = listener.local_addr().expect("stub CRM address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            accepted_key: options.accepted_key,
            state,
            handle,
        }
    }

    /// Authorized and unauthorized probe attempts alike.
    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    /// Successfully authorized calls of any kind.
    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.state
            .last_body
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_query(&self) -> Option<HashMap<String, String>> {
        self.state
            .last_query
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for StubCrm {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn location(
    State(state): State<Arc<StubState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.probes.fetch_add(1, Ordering::SeqCst);
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    Json(json!({ "location": { "id": id, "name": "Stub Location" } })).into_response()
}

async fn search_contacts(
    State(state): State<Arc<StubState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    if let Some(delay) = state.search_delay {
        tokio::time::sleep(delay).await;
    }
    state.record_query(&query);
    Json(json!({
        "contacts": [
            { "id": "c-1", "firstName": "Jane", "lastName": "Doe", "email": "jane@example.com" }
        ],
        "total": 1
    }))
    .into_response()
}

async fn create_contact(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    state.record_body(&body);
    let mut contact = body;
    contact["id"] = json!("c-new");
    (StatusCode::CREATED, Json(json!({ "contact": contact }))).into_response()
}

async fn send_message(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    state.record_body(&body);
    Json(json!({ "messageId": "m-1", "conversationId": "conv-1" })).into_response()
}

async fn create_blog(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    state.record_body(&body);
    Json(json!({ "id": "b-1", "url": "https://blog.example.com/b-1" })).into_response()
}

async fn search_opportunities(
    State(state): State<Arc<StubState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = state.check_headers(&headers) {
        return rejection;
    }
    state.record_query(&query);
    let status = query.get("status").cloned().unwrap_or_default();
    Json(json!({
        "opportunities": [{ "id": "o-1", "status": status }],
        "total": 1
    }))
    .into_response()
}
