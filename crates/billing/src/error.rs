//! Billing error types

use classbook_shared::StoreError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment gateway error [{code}]: {message}")]
    Gateway { code: String, message: String },

    #[error("Payment gateway request failed: {0}")]
    GatewayTransport(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Invalid order id: {0}")]
    InvalidOrderId(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// A compare-and-swap write lost a race; the operation can be retried
    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::Store(e) if e.is_conflict())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::GatewayTransport(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
