//! Payment gateway webhooks
//!
//! The gateway posts `{orderId, paymentKey, status, method, totalAmount}`,
//! either flat or wrapped as `{eventType, data: {...}}`. When a webhook secret
//! is configured the body must carry a hex HMAC-SHA256 signature.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};
use crate::payment::{GatewayUpdate, PaymentStatus, UpdateSource};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "x-classbook-signature";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub order_id: String,
    #[serde(default)]
    pub payment_key: Option<String>,
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub total_amount: Option<i64>,
}

impl WebhookPayload {
    /// Parse a raw webhook body
    pub fn parse(body: &str) -> BillingResult<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        // Envelope form: {"eventType": "...", "data": {...}}
        let inner = match value.get("data") {
            Some(data) if data.is_object() && value.get("orderId").is_none() => data.clone(),
            _ => value,
        };

        serde_json::from_value(inner).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    /// Convert into a status update
    pub fn to_update(&self) -> BillingResult<GatewayUpdate> {
        let status = PaymentStatus::from_gateway(&self.status).ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!("unknown payment status '{}'", self.status))
        })?;
        Ok(GatewayUpdate {
            status,
            source: UpdateSource::Webhook,
            payment_key: self.payment_key.clone(),
            method: self.method.clone(),
            total_amount: self.total_amount,
            notes: None,
        })
    }
}

/// Verify the webhook signature.
///
/// With no secret configured verification is skipped.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature: Option<&str>) -> BillingResult<()> {
    let Some(secret) = secret else {
        tracing::debug!("Webhook secret not configured, skipping signature verification");
        return Ok(());
    };

    let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
    let expected = hex::decode(signature.trim()).map_err(|_| BillingError::WebhookSignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    // verify_slice compares in constant time
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

/// Compute the signature for a body (used by tests and manual tooling)
pub fn sign(secret: &str, body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
