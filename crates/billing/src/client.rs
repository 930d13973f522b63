//! Payment gateway client configuration and REST calls
//!
//! The gateway authenticates with `Authorization: Basic base64("<secret>:")`
//! and reports failures as `{code, message}` JSON bodies.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::order_id::validate_order_id;

/// Configuration for the payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway secret API key
    pub secret_key: String,
    /// REST API base URL
    pub api_base: String,
    /// Shared secret for webhook signatures; unset disables verification
    pub webhook_secret: Option<String>,
    /// Base URL for success/fail redirects
    pub app_base_url: String,
    pub currency: String,
}

impl GatewayConfig {
    pub fn success_url(&self) -> String {
        format!("{}/api/payments/success", self.app_base_url.trim_end_matches('/'))
    }

    pub fn fail_url(&self) -> String {
        format!("{}/api/payments/fail", self.app_base_url.trim_end_matches('/'))
    }
}

/// Payment object as returned by the gateway
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPayment {
    pub payment_key: Option<String>,
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub checkout: Option<GatewayCheckout>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayCheckout {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Request to open a payment window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkRequest {
    pub method: String,
    pub amount: i64,
    pub order_id: String,
    pub order_name: String,
    pub success_url: String,
    pub fail_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest<'a> {
    payment_key: &'a str,
    order_id: &'a str,
    amount: i64,
}

/// Payment gateway client
#[derive(Clone)]
pub struct PaymentGatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl PaymentGatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn authorization(&self) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:", self.config.secret_key)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Create a payment and return the gateway object with its checkout URL
    pub async fn create_payment_link(&self, req: &PaymentLinkRequest) -> BillingResult<GatewayPayment> {
        tracing::info!(order_id = %req.order_id, amount = req.amount, "Creating gateway payment link");
        let response = self
            .http
            .post(self.url("/v1/payments"))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(req)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Confirm a payment after the customer returns from the payment window
    pub async fn confirm_payment(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> BillingResult<GatewayPayment> {
        tracing::info!(order_id = %order_id, amount, "Confirming payment with gateway");
        let response = self
            .http
            .post(self.url("/v1/payments/confirm"))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&ConfirmRequest {
                payment_key,
                order_id,
                amount,
            })
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Look up the gateway's view of an order
    pub async fn get_payment_by_order_id(&self, order_id: &str) -> BillingResult<GatewayPayment> {
        // The id becomes a path segment of an authenticated request
        validate_order_id(order_id)?;
        let response = self
            .http
            .get(self.url(&format!("/v1/payments/orders/{}", order_id)))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> BillingResult<GatewayPayment> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<GatewayPayment>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<GatewayErrorBody> = serde_json::from_str(&body).ok();
        let (code, message) = match parsed {
            Some(err) => (
                err.code.unwrap_or_else(|| status.as_u16().to_string()),
                err.message.unwrap_or_else(|| body.clone()),
            ),
            None => (status.as_u16().to_string(), body),
        };
        tracing::warn!(http_status = %status, code = %code, message = %message, "Payment gateway returned an error");
        Err(BillingError::Gateway { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_base: String) -> GatewayConfig {
        GatewayConfig {
            secret_key: "test_sk_123".to_string(),
            api_base,
            webhook_secret: None,
            app_base_url: "https://classbook.test/".to_string(),
            currency: "KRW".to_string(),
        }
    }

    #[test]
    fn test_redirect_urls() {
        let cfg = config("http://unused".to_string());
        assert_eq!(cfg.success_url(), "https://classbook.test/api/payments/success");
        assert_eq!(cfg.fail_url(), "https://classbook.test/api/payments/fail");
    }

    #[tokio::test]
    async fn test_confirm_sends_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        // base64("test_sk_123:")
        let mock = server
            .mock("POST", "/v1/payments/confirm")
            .match_header("authorization", "Basic dGVzdF9za18xMjM6")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "paymentKey": "pk_1",
                "orderId": "ORD-1-abcdef",
                "amount": 50000
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"paymentKey":"pk_1","orderId":"ORD-1-abcdef","status":"DONE","method":"카드","totalAmount":50000}"#)
            .create_async()
            .await;

        let client = PaymentGatewayClient::new(config(server.url())).unwrap();
        let payment = client.confirm_payment("pk_1", "ORD-1-abcdef", 50000).await.unwrap();

        mock.assert_async().await;
        assert_eq!(payment.status, "DONE");
        assert_eq!(payment.total_amount, Some(50000));
    }

    #[tokio::test]
    async fn test_gateway_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/payments/confirm")
            .with_status(400)
            .with_body(r#"{"code":"ALREADY_PROCESSED_PAYMENT","message":"이미 처리된 결제 입니다."}"#)
            .create_async()
            .await;

        let client = PaymentGatewayClient::new(config(server.url())).unwrap();
        let err = client.confirm_payment("pk_1", "ORD-1-abcdef", 100).await.unwrap_err();
        match err {
            BillingError::Gateway { code, .. } => assert_eq!(code, "ALREADY_PROCESSED_PAYMENT"),
            other => panic!("expected gateway error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_payment_link_returns_checkout_url() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/payments")
            .with_status(200)
            .with_body(r#"{"paymentKey":null,"orderId":"ORD-9-zzzzzz","status":"READY","checkout":{"url":"https://pay.test/c/1"}}"#)
            .create_async()
            .await;

        let client = PaymentGatewayClient::new(config(server.url())).unwrap();
        let payment = client
            .create_payment_link(&PaymentLinkRequest {
                method: "CARD".to_string(),
                amount: 30000,
                order_id: "ORD-9-zzzzzz".to_string(),
                order_name: "Ann - 4 classes".to_string(),
                success_url: "https://classbook.test/api/payments/success".to_string(),
                fail_url: "https://classbook.test/api/payments/fail".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(payment.checkout.and_then(|c| c.url).as_deref(), Some("https://pay.test/c/1"));
    }

    #[tokio::test]
    async fn test_get_payment_by_order_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/orders/ORD-7-abcdef")
            .match_header("authorization", "Basic dGVzdF9za18xMjM6")
            .with_status(200)
            .with_body(r#"{"paymentKey":"pk_7","orderId":"ORD-7-abcdef","status":"WAITING_FOR_DEPOSIT","totalAmount":30000}"#)
            .create_async()
            .await;

        let client = PaymentGatewayClient::new(config(server.url())).unwrap();
        let payment = client.get_payment_by_order_id("ORD-7-abcdef").await.unwrap();

        mock.assert_async().await;
        assert_eq!(payment.status, "WAITING_FOR_DEPOSIT");
        assert_eq!(payment.payment_key.as_deref(), Some("pk_7"));
    }

    #[tokio::test]
    async fn test_get_payment_rejects_path_characters() {
        let client = PaymentGatewayClient::new(config("http://127.0.0.1:1".to_string())).unwrap();
        let err = client.get_payment_by_order_id("../../v1/secret").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidOrderId(_)));
    }
}
