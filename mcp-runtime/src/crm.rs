//! Upstream Client Factory and the thin CRM REST client it produces.
//!
//! The factory holds the one pooled `reqwest::Client` (with the bounded
//! upstream timeout baked in); `build` only pairs it with a session's
//! credentials, so it never touches the network.

use std::time::{Duration, Instant};

use crm_gateway_core::session::Credentials;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use url::Url;

pub const DEFAULT_CRM_BASE_URL: &str = "https://services.leadconnectorhq.com";
pub const DEFAULT_CRM_API_VERSION: &str = "2021-07-28";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(20);

const API_VERSION_HEADER: &str = "Version";

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_version: String,
    /// Applied to every upstream call, connect through body read.
    pub timeout: Duration,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CRM_BASE_URL.to_string(),
            api_version: DEFAULT_CRM_API_VERSION.to_string(),
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("invalid CRM base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build CRM HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("CRM API did not answer within {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("failed to reach CRM API: {0}")]
    Transport(String),
    #[error("CRM API returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        body: Value,
    },
}

impl CrmError {
    /// Stable machine code surfaced in tool error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CrmError::InvalidBaseUrl { .. } | CrmError::ClientBuild(_) => "upstream_misconfigured",
            CrmError::Timeout(_) => "upstream_timeout",
            CrmError::Transport(_) => "upstream_unreachable",
            CrmError::Status { .. } => "upstream_error",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CrmError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageType {
    #[serde(rename = "SMS")]
    Sms,
    Email,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SMS" | "sms" => Some(Self::Sms),
            "Email" | "email" | "EMAIL" => Some(Self::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlogStatus {
    Draft,
    Published,
}

impl BlogStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Open,
    Won,
    Lost,
    Abandoned,
}

impl OpportunityStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub contact_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBlogPost {
    pub title: String,
    pub content: String,
    pub status: BlogStatus,
}

/// Builds per-session CRM clients over a shared connection pool.
#[derive(Clone, Debug)]
pub struct CrmClientFactory {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    timeout: Duration,
}

impl CrmClientFactory {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url).map_err(|e| CrmError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(CrmError::InvalidBaseUrl {
                url: config.base_url.clone(),
                reason: "expected an absolute http(s) URL".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(CrmError::ClientBuild)?;

        Ok(Self {
            http,
            base_url,
            api_version: config.api_version.clone(),
            timeout: config.timeout,
        })
    }

    /// Binds credentials to the shared pool. No network traffic.
    pub fn build(&self, credentials: &Credentials) -> CrmClient {
        CrmClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_version: self.api_version.clone(),
            timeout: self.timeout,
            credentials: credentials.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    timeout: Duration,
    credentials: Credentials,
}

impl CrmClient {
    pub fn account_id(&self) -> &str {
        self.credentials.account_id()
    }

    /// Read-only account lookup; used as the authentication probe.
    pub async fn get_location(&self) -> Result<Value, CrmError> {
        self.send(
            Method::GET,
            &["locations", self.account_id()],
            &[],
            None,
        )
        .await
    }

    pub async fn search_contacts(&self, query: &str, limit: u64) -> Result<Value, CrmError> {
        self.send(
            Method::GET,
            &["contacts", ""],
            &[
                ("locationId", self.account_id().to_string()),
                ("query", query.to_string()),
                ("limit", limit.to_string()),
            ],
            None,
        )
        .await
    }

    pub async fn create_contact(&self, contact: &NewContact) -> Result<Value, CrmError> {
        let mut body = json!(contact);
        body["locationId"] = Value::String(self.account_id().to_string());
        self.send(Method::POST, &["contacts", ""], &[], Some(body))
            .await
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<Value, CrmError> {
        self.send(
            Method::POST,
            &["conversations", "messages"],
            &[],
            Some(json!(message)),
        )
        .await
    }

    pub async fn create_blog_post(&self, post: &NewBlogPost) -> Result<Value, CrmError> {
        let mut body = json!(post);
        body["locationId"] = Value::String(self.account_id().to_string());
        self.send(Method::POST, &["blogs", ""], &[], Some(body))
            .await
    }

    pub async fn search_opportunities(
        &self,
        status: OpportunityStatus,
        limit: u64,
    ) -> Result<Value, CrmError> {
        self.send(
            Method::GET,
            &["opportunities", "search"],
            &[
                ("location_id", self.account_id().to_string()),
                ("limit", limit.to_string()),
                ("status", status.as_str().to_string()),
            ],
            None,
        )
        .await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CrmError> {
        let invalid = |reason: &str| CrmError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, CrmError> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();
        let started = Instant::now();

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(self.credentials.api_key())
            .header(API_VERSION_HEADER, &self.api_version)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let body = parse_response_body(&bytes);

        tracing::debug!(
            event = "crm_request",
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "CRM API call finished"
        );

        if status.is_success() {
            return Ok(body);
        }

        let message = upstream_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });
        Err(CrmError::Status {
            status: status.as_u16(),
            message,
            body,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> CrmError {
        if err.is_timeout() {
            CrmError::Timeout(self.timeout)
        } else {
            CrmError::Transport(err.to_string())
        }
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(bytes).to_string() }))
}

/// The CRM reports failures as `{"message": "..."}` or `{"message": ["...", ...]}`.
fn upstream_message(body: &Value) -> Option<String> {
    match body.get("message") {
        Some(Value::String(message)) if !message.trim().is_empty() => Some(message.clone()),
        Some(Value::Array(items)) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        _ => body
            .get("error")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubCrm, StubOptions};

    fn factory(base_url: &str) -> CrmClientFactory {
        CrmClientFactory::new(&CrmConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        })
        .expect("factory should build")
    }

    fn creds(key: &str) -> Credentials {
        Credentials::new(key, "loc-1").expect("valid credentials")
    }

    #[test]
    fn factory_rejects_unusable_base_urls() {
        for bad in ["not a url", "mailto:ops@example.com", "ftp://example.com"] {
            let err = CrmClientFactory::new(&CrmConfig {
                base_url: bad.to_string(),
                ..Default::default()
            })
            .expect_err("base url should be rejected");
            assert!(matches!(err, CrmError::InvalidBaseUrl { .. }), "{bad}");
        }
    }

    #[test]
    fn endpoint_keeps_base_path_and_encodes_segments() {
        let client = factory("http://127.0.0.1:9/v2/").build(&creds("pit-a"));
        let url = client
            .endpoint(&["locations", "loc 1/x"])
            .expect("endpoint");
        assert_eq!(url.as_str(), "http://127.0.0.1:9/v2/locations/loc%201%2Fx");

        let url = client.endpoint(&["contacts", ""]).expect("endpoint");
        assert_eq!(url.as_str(), "http://127.0.0.1:9/v2/contacts/");
    }

    #[test]
    fn upstream_message_handles_string_and_array_shapes() {
        assert_eq!(
            upstream_message(&json!({"message": "Invalid JWT"})).as_deref(),
            Some("Invalid JWT")
        );
        assert_eq!(
            upstream_message(&json!({"message": ["title is required", "bad status"]})).as_deref(),
            Some("title is required; bad status")
        );
        assert_eq!(
            upstream_message(&json!({"error": "Unauthorized"})).as_deref(),
            Some("Unauthorized")
        );
        assert_eq!(upstream_message(&json!({"statusCode": 500})), None);
    }

    #[test]
    fn outbound_payloads_use_upstream_field_names() {
        let message = OutboundMessage {
            kind: MessageType::Sms,
            contact_id: "c-1".to_string(),
            message: "hi".to_string(),
            subject: None,
        };
        assert_eq!(
            json!(message),
            json!({"type": "SMS", "contactId": "c-1", "message": "hi"})
        );

        let contact = NewContact {
            first_name: "Jane".to_string(),
            last_name: None,
            email: Some("jane@example.com".to_string()),
            phone: "+15550100".to_string(),
        };
        assert_eq!(
            json!(contact),
            json!({"firstName": "Jane", "email": "jane@example.com", "phone": "+15550100"})
        );
    }

    #[tokio::test]
    async fn probe_succeeds_for_accepted_key_and_sends_required_headers() {
        let stub = StubCrm::start(StubOptions::default()).await;
        let client = factory(&stub.base_url).build(&creds(&stub.accepted_key));

        let body = client.get_location().await.expect("probe should succeed");
        assert_eq!(body["location"]["id"], "loc-1");
        assert_eq!(stub.probe_count(), 1);
    }

    #[tokio::test]
    async fn rejected_key_maps_to_status_error_with_upstream_message() {
        let stub = StubCrm::start(StubOptions::default()).await;
        let client = factory(&stub.base_url).build(&creds("pit-wrong"));

        let err = client.get_location().await.expect_err("probe should fail");
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.code(), "upstream_error");
        assert!(err.to_string().contains("Invalid JWT"), "{err}");
    }

    #[tokio::test]
    async fn slow_upstream_hits_the_bounded_timeout() {
        let stub = StubCrm::start(StubOptions {
            search_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        })
        .await;
        let factory = CrmClientFactory::new(&CrmConfig {
            base_url: stub.base_url.clone(),
            timeout: Duration::from_millis(150),
            ..Default::default()
        })
        .expect("factory");
        let client = factory.build(&creds(&stub.accepted_key));

        let err = client
            .search_contacts("jane", 10)
            .await
            .expect_err("search should time out");
        assert!(matches!(err, CrmError::Timeout(_)), "{err:?}");
        assert_eq!(err.code(), "upstream_timeout");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_transport_error() {
        let client = factory("http://127.0.0.1:9").build(&creds("pit-a"));
        let err = client.get_location().await.expect_err("nothing listens on port 9");
        assert!(
            matches!(err, CrmError::Transport(_) | CrmError::Timeout(_)),
            "{err:?}"
        );
    }
}
