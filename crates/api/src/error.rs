//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use classbook_billing::BillingError;
use classbook_shared::StoreError;
use serde_json::json;

use crate::tts::TtsError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource conflict: {0}")]
    Conflict(String),

    // Upstream errors
    #[error("Payment gateway error [{code}]: {message}")]
    Gateway { code: String, message: String },
    #[error("Upstream service error: {0}")]
    Upstream(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Upstream
            ApiError::Gateway { code, message } => (StatusCode::BAD_GATEWAY, code.as_str(), message.clone()),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", "Upstream service error".to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone()),
        };

        let body = Json(json!({
            "ok": false,
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound,
            StoreError::VersionConflict { .. } | StoreError::Duplicate(_) => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::InvalidDocument(msg) => ApiError::Validation(msg),
            other => {
                tracing::error!("Store error: {:?}", other);
                ApiError::Database(other.to_string())
            }
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) | BillingError::InvalidOrderId(msg) => ApiError::Validation(msg),
            BillingError::WebhookPayloadInvalid(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::Gateway { code, message } => ApiError::Gateway { code, message },
            BillingError::GatewayTransport(msg) => {
                tracing::error!("Payment gateway unreachable: {}", msg);
                ApiError::Upstream(msg)
            }
            BillingError::Config(msg) => {
                tracing::warn!("Billing not configured: {}", msg);
                ApiError::ServiceUnavailable(msg)
            }
            BillingError::Store(e) => e.into(),
            BillingError::Internal(msg) => {
                tracing::error!("Billing internal error: {}", msg);
                ApiError::Internal
            }
        }
    }
}

impl From<TtsError> for ApiError {
    fn from(err: TtsError) -> Self {
        match err {
            TtsError::InvalidInput(msg) => ApiError::Validation(msg),
            TtsError::NotConfigured => ApiError::ServiceUnavailable(err.to_string()),
            other => {
                tracing::error!("Speech synthesis failed: {}", other);
                ApiError::Upstream(other.to_string())
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
