use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crm_gateway_core::error::{self, ApiError};

/// Errors on the plain HTTP surfaces (everything that is not a JSON-RPC envelope).
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        docs_hint: Option<String>,
    },
    /// Unknown resource, e.g. a closed push channel (404)
    NotFound {
        message: String,
        docs_hint: Option<String>,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::NotFound { message, docs_hint } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message,
                    field: None,
                    request_id,
                    docs_hint,
                },
            ),
        };

        (status, Json(api_error)).into_response()
    }
}
