//! Billing service facade
//!
//! Ties the payment record writer, the gateway client and the billing status
//! log together for the payment flows exposed over HTTP.

use std::sync::Arc;

use classbook_shared::DocumentStore;
use serde::Serialize;
use serde_json::{json, Value};

use crate::checks::{BillingCheckService, BillingStep};
use crate::client::{GatewayPayment, PaymentGatewayClient, PaymentLinkRequest};
use crate::error::{BillingError, BillingResult};
use crate::order_id::{validate_order_id, OrderIdAllocator};
use crate::payment::{GatewayUpdate, NewPayment, Payment, PaymentService, PaymentStatus, StatusUpdate, UpdateSource};
use crate::webhook::{verify_signature, WebhookPayload};

/// Caller input for generating a payment link
#[derive(Debug, Clone)]
pub struct PaymentLinkInput {
    pub student_name: String,
    pub amount: i64,
    pub order_name: Option<String>,
    pub method: Option<String>,
    pub currency: Option<String>,
    pub metadata: Value,
}

/// A generated payment link
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLink {
    pub order_id: String,
    pub checkout_url: Option<String>,
    /// False when the pending record could not be written
    pub recorded: bool,
}

pub struct BillingService {
    pub payments: PaymentService,
    pub checks: BillingCheckService,
    gateway: Option<PaymentGatewayClient>,
    order_ids: OrderIdAllocator,
    currency: String,
    webhook_secret: Option<String>,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Option<PaymentGatewayClient>,
        order_ids: OrderIdAllocator,
        tz_offset_hours: i32,
    ) -> Self {
        let currency = gateway
            .as_ref()
            .map(|g| g.config().currency.clone())
            .unwrap_or_else(|| "KRW".to_string());
        let webhook_secret = gateway.as_ref().and_then(|g| g.config().webhook_secret.clone());
        Self {
            payments: PaymentService::new(store.clone()),
            checks: BillingCheckService::new(store, tz_offset_hours),
            gateway,
            order_ids,
            currency,
            webhook_secret,
        }
    }

    /// Override the webhook secret (normally taken from the gateway config)
    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn gateway(&self) -> BillingResult<&PaymentGatewayClient> {
        self.gateway
            .as_ref()
            .ok_or_else(|| BillingError::Config("payment gateway is not configured".to_string()))
    }

    /// Allocate an order id, record the pending payment and ask the gateway
    /// for a checkout link.
    pub async fn generate_payment_link(&self, input: PaymentLinkInput) -> BillingResult<PaymentLink> {
        if input.student_name.trim().is_empty() {
            return Err(BillingError::InvalidInput("student_name is required".to_string()));
        }
        if input.amount <= 0 {
            return Err(BillingError::InvalidInput("amount must be positive".to_string()));
        }
        let gateway = self.gateway()?;

        let order_id = self.order_ids.allocate();
        validate_order_id(&order_id)?;

        // Bookkeeping failures must not block the link
        let recorded = self
            .payments
            .create_payment(NewPayment {
                order_id: order_id.clone(),
                student_name: input.student_name.clone(),
                amount: input.amount,
                currency: input.currency.clone().unwrap_or_else(|| self.currency.clone()),
                metadata: input.metadata.clone(),
            })
            .await
            .is_some();

        let request = PaymentLinkRequest {
            method: input.method.unwrap_or_else(|| "CARD".to_string()),
            amount: input.amount,
            order_id: order_id.clone(),
            order_name: input
                .order_name
                .unwrap_or_else(|| format!("{} 수업료", input.student_name)),
            success_url: gateway.config().success_url(),
            fail_url: gateway.config().fail_url(),
        };
        let created = gateway.create_payment_link(&request).await?;

        Ok(PaymentLink {
            order_id,
            checkout_url: created.checkout.and_then(|c| c.url),
            recorded,
        })
    }

    /// Confirm a payment with the gateway after the redirect back
    pub async fn confirm_payment(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
        source: UpdateSource,
    ) -> BillingResult<(GatewayPayment, Option<StatusUpdate>)> {
        validate_order_id(order_id)?;
        if payment_key.trim().is_empty() {
            return Err(BillingError::InvalidInput("paymentKey is required".to_string()));
        }
        let gateway = self.gateway()?;
        let confirmed = gateway.confirm_payment(payment_key, order_id, amount).await?;
        let update = update_from_gateway(&confirmed, source)?;
        let outcome = self.apply_update(order_id, update).await?;
        Ok((confirmed, outcome))
    }

    /// Pull the gateway's current view of an order and apply it
    pub async fn sync_payment(&self, order_id: &str) -> BillingResult<Option<StatusUpdate>> {
        validate_order_id(order_id)?;
        let gateway = self.gateway()?;
        let remote = gateway.get_payment_by_order_id(order_id).await?;
        let update = update_from_gateway(&remote, UpdateSource::Sync)?;
        self.apply_update(order_id, update).await
    }

    /// Verify and apply a webhook delivery
    pub async fn handle_webhook(
        &self,
        body: &str,
        signature: Option<&str>,
    ) -> BillingResult<(WebhookPayload, Option<StatusUpdate>)> {
        verify_signature(self.webhook_secret.as_deref(), body.as_bytes(), signature)?;
        let payload = WebhookPayload::parse(body)?;
        let update = payload.to_update()?;
        let outcome = self.apply_update(&payload.order_id, update).await?;
        Ok((payload, outcome))
    }

    /// Record a failed or cancelled checkout reported on the fail redirect
    pub async fn record_failure(
        &self,
        order_id: &str,
        code: Option<&str>,
        message: Option<&str>,
    ) -> BillingResult<Option<StatusUpdate>> {
        // The gateway reports a user-closed window as PAY_PROCESS_CANCELED
        let status = match code {
            Some("PAY_PROCESS_CANCELED") | Some("USER_CANCEL") => PaymentStatus::Canceled,
            _ => PaymentStatus::Failed,
        };
        let notes = match (code, message) {
            (Some(c), Some(m)) => Some(format!("{}: {}", c, m)),
            (Some(c), None) => Some(c.to_string()),
            (None, Some(m)) => Some(m.to_string()),
            (None, None) => None,
        };
        let update = GatewayUpdate {
            notes,
            ..GatewayUpdate::new(status, UpdateSource::Redirect)
        };
        self.apply_update(order_id, update).await
    }

    /// Apply a status change and run completion side effects once.
    ///
    /// Side effects (student credit, billing step) are logged on failure and
    /// never undo the status write.
    pub async fn apply_update(
        &self,
        order_id: &str,
        update: GatewayUpdate,
    ) -> BillingResult<Option<StatusUpdate>> {
        validate_order_id(order_id)?;
        let outcome = self.payments.update_payment_status(order_id, update).await?;

        if let Some(outcome) = outcome.as_ref().filter(|o| o.completed_now()) {
            self.on_completed(&outcome.payment).await;
        }
        Ok(outcome)
    }

    async fn on_completed(&self, payment: &Payment) {
        // A payment left without creditedAt is picked up by the reconciliation worker
        if let Err(e) = self.payments.apply_completion(payment).await {
            tracing::error!(order_id = %payment.order_id, error = %e, "Failed to update student after payment");
        }

        let Some(yyyymm) = payment.billing_month() else {
            return;
        };
        if let Err(e) = self
            .checks
            .record_step(
                BillingStep::PaymentConfirm,
                &payment.student_name,
                yyyymm,
                Some("payment"),
                json!({"orderId": payment.order_id, "amount": payment.amount}),
            )
            .await
        {
            tracing::error!(order_id = %payment.order_id, error = %e, "Failed to record PaymentConfirm step");
        }
    }
}

fn update_from_gateway(payment: &GatewayPayment, source: UpdateSource) -> BillingResult<GatewayUpdate> {
    let status = PaymentStatus::from_gateway(&payment.status).ok_or_else(|| BillingError::Gateway {
        code: "UNKNOWN_STATUS".to_string(),
        message: format!("unknown payment status '{}'", payment.status),
    })?;
    Ok(GatewayUpdate {
        status,
        source,
        payment_key: payment.payment_key.clone(),
        method: payment.method.clone(),
        total_amount: payment.total_amount,
        notes: None,
    })
}
