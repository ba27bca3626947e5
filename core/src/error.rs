use serde::Serialize;
use utoipa::ToSchema;

/// Structured error body for the gateway's plain HTTP surfaces.
/// JSON-RPC traffic never uses this shape; it always answers with an envelope.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "not_found", "rate_limited")
    pub error: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which field or parameter caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the HTTP surfaces
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const RATE_LIMITED: &str = "rate_limited";
}
