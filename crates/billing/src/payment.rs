//! Payment records
//!
//! A payment document is written as `INITIATED` when a link is generated and
//! then moved to `DONE`, `CANCELED` or `FAILED` by whichever trigger arrives:
//! the browser redirect, the gateway webhook, or a manual update. Writes use
//! compare-and-swap on the document version so concurrent triggers never drop
//! a history entry; the terminal status itself is last-write-wins.

use std::sync::Arc;

use classbook_shared::{
    collections, payment_status, to_body, Document, DocumentStore, Filter, Student,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};

use crate::error::{BillingError, BillingResult};

/// Attempts for a compare-and-swap write before giving up
const MAX_WRITE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    Done,
    Canceled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::Done => "DONE",
            PaymentStatus::Canceled => "CANCELED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    /// Map a gateway status string onto the local lifecycle
    pub fn from_gateway(status: &str) -> Option<Self> {
        match status.trim().to_uppercase().as_str() {
            "DONE" => Some(PaymentStatus::Done),
            "CANCELED" | "CANCELLED" | "PARTIAL_CANCELED" => Some(PaymentStatus::Canceled),
            "ABORTED" | "EXPIRED" | "FAILED" => Some(PaymentStatus::Failed),
            "READY" | "IN_PROGRESS" | "WAITING_FOR_DEPOSIT" | "INITIATED" => {
                Some(PaymentStatus::Initiated)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What triggered a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Create,
    Redirect,
    Confirm,
    Webhook,
    Manual,
    Sync,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateSource::Create => "create",
            UpdateSource::Redirect => "redirect",
            UpdateSource::Confirm => "confirm",
            UpdateSource::Webhook => "webhook",
            UpdateSource::Manual => "manual",
            UpdateSource::Sync => "sync",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: UpdateSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
}

/// Payment document body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub order_id: String,
    #[serde(rename = "student_name")]
    pub student_name: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub metadata: Value,
    /// Set once the student has been marked paid for this payment
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub credited_at: Option<OffsetDateTime>,
}

impl Payment {
    /// Classes purchased by this payment, if the caller recorded them
    pub fn purchased_credits(&self) -> Option<i64> {
        self.metadata.get("credits").and_then(Value::as_i64)
    }

    /// Billing month this payment settles, if the caller recorded it
    pub fn billing_month(&self) -> Option<&str> {
        self.metadata.get("yyyymm").and_then(Value::as_str)
    }

    fn is_redelivery(&self, update: &GatewayUpdate) -> bool {
        self.status_history.last().is_some_and(|last| {
            last.status == update.status
                && last.source == update.source
                && last.payment_key == update.payment_key
        })
    }
}

/// Input for a new payment record
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: String,
    pub student_name: String,
    pub amount: i64,
    pub currency: String,
    pub metadata: Value,
}

/// A status change reported by one of the triggers
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayUpdate {
    pub status: PaymentStatus,
    pub source: UpdateSource,
    pub payment_key: Option<String>,
    pub method: Option<String>,
    pub total_amount: Option<i64>,
    pub notes: Option<String>,
}

impl GatewayUpdate {
    pub fn new(status: PaymentStatus, source: UpdateSource) -> Self {
        Self {
            status,
            source,
            payment_key: None,
            method: None,
            total_amount: None,
            notes: None,
        }
    }
}

/// Result of applying a status update
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub payment: Payment,
    pub previous_status: PaymentStatus,
    /// False when the update was an identical redelivery and nothing was written
    pub applied: bool,
}

impl StatusUpdate {
    /// True when this update moved the payment into `DONE`
    pub fn completed_now(&self) -> bool {
        self.applied
            && self.payment.status == PaymentStatus::Done
            && self.previous_status != PaymentStatus::Done
    }
}

/// Service for payment bookkeeping
pub struct PaymentService {
    store: Arc<dyn DocumentStore>,
}

impl PaymentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist a pending payment.
    ///
    /// Never fails: errors are logged and `None` is returned so that link
    /// generation is not blocked by bookkeeping. A repeated `order_id`
    /// returns the existing record without writing.
    pub async fn create_payment(&self, new: NewPayment) -> Option<Payment> {
        match self.try_create_payment(new).await {
            Ok(payment) => Some(payment),
            Err(e) => {
                tracing::error!(error = %e, "Failed to record pending payment");
                None
            }
        }
    }

    async fn try_create_payment(&self, new: NewPayment) -> BillingResult<Payment> {
        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            order_id: new.order_id,
            student_name: new.student_name,
            amount: new.amount,
            currency: new.currency,
            status: PaymentStatus::Initiated,
            status_history: vec![StatusHistoryEntry {
                status: PaymentStatus::Initiated,
                timestamp: now,
                source: UpdateSource::Create,
                notes: None,
                payment_key: None,
            }],
            payment_key: None,
            method: None,
            created_at: now,
            updated_at: now,
            metadata: if new.metadata.is_null() { json!({}) } else { new.metadata },
            credited_at: None,
        };

        let (doc, created) = self
            .store
            .insert_if_absent(
                collections::PAYMENTS,
                &Filter::new().eq("orderId", payment.order_id.as_str()),
                to_body(&payment)?,
            )
            .await?;
        if !created {
            tracing::warn!(
                order_id = %payment.order_id,
                "Payment with this orderId already exists, keeping the original"
            );
            return Ok(doc.decode::<Payment>()?);
        }

        tracing::info!(
            order_id = %payment.order_id,
            student = %payment.student_name,
            amount = payment.amount,
            "Payment record created"
        );
        Ok(payment)
    }

    pub async fn find_payment(&self, order_id: &str) -> BillingResult<Option<(Document, Payment)>> {
        let doc = self
            .store
            .find_one(collections::PAYMENTS, &Filter::new().eq("orderId", order_id))
            .await?;
        match doc {
            Some(doc) => {
                let payment = doc.decode::<Payment>()?;
                Ok(Some((doc, payment)))
            }
            None => Ok(None),
        }
    }

    /// Payments still `INITIATED` and created before `older_than`
    pub async fn stale_payments(&self, older_than: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        let docs = self
            .store
            .find(
                collections::PAYMENTS,
                &Filter::new().eq("status", PaymentStatus::Initiated.as_str()),
            )
            .await?;
        let mut stale = Vec::new();
        for doc in docs {
            let payment = doc.decode::<Payment>()?;
            if payment.created_at < older_than {
                stale.push(payment);
            }
        }
        Ok(stale)
    }

    /// Completed payments whose student has not been marked paid yet
    pub async fn uncredited_payments(&self) -> BillingResult<Vec<Payment>> {
        let docs = self
            .store
            .find(
                collections::PAYMENTS,
                &Filter::new().eq("status", PaymentStatus::Done.as_str()),
            )
            .await?;
        let mut pending = Vec::new();
        for doc in docs {
            let payment = doc.decode::<Payment>()?;
            if payment.credited_at.is_none() {
                pending.push(payment);
            }
        }
        Ok(pending)
    }

    /// Apply a status change to the payment with `order_id`.
    ///
    /// Returns `Ok(None)` with a warning when no such payment exists; several
    /// triggers may race to be first and a missing record is not an error.
    pub async fn update_payment_status(
        &self,
        order_id: &str,
        update: GatewayUpdate,
    ) -> BillingResult<Option<StatusUpdate>> {
        let strategy = ExponentialBackoff::from_millis(10)
            .map(jitter)
            .take(MAX_WRITE_ATTEMPTS - 1);

        let result = RetryIf::spawn(
            strategy,
            || self.try_update_status(order_id, &update),
            |e: &BillingError| {
                if e.is_conflict() {
                    tracing::debug!(order_id = %order_id, "Concurrent payment update, retrying");
                    true
                } else {
                    false
                }
            },
        )
        .await?;

        match &result {
            None => tracing::warn!(
                order_id = %order_id,
                status = %update.status,
                source = %update.source,
                "Status update for unknown orderId ignored"
            ),
            Some(outcome) if !outcome.applied => tracing::info!(
                order_id = %order_id,
                status = %update.status,
                source = %update.source,
                "Duplicate status delivery ignored"
            ),
            Some(outcome) => tracing::info!(
                order_id = %order_id,
                from = %outcome.previous_status,
                to = %outcome.payment.status,
                source = %update.source,
                "Payment status updated"
            ),
        }
        Ok(result)
    }

    async fn try_update_status(
        &self,
        order_id: &str,
        update: &GatewayUpdate,
    ) -> BillingResult<Option<StatusUpdate>> {
        let Some((doc, mut payment)) = self.find_payment(order_id).await? else {
            return Ok(None);
        };
        let previous_status = payment.status;

        if payment.is_redelivery(update) {
            return Ok(Some(StatusUpdate {
                payment,
                previous_status,
                applied: false,
            }));
        }

        let mut notes = update.notes.clone();
        if let Some(total) = update.total_amount {
            if total != payment.amount {
                tracing::warn!(
                    order_id = %order_id,
                    expected = payment.amount,
                    reported = total,
                    "Gateway amount differs from recorded amount"
                );
                let mismatch = format!("amount mismatch: recorded {}, reported {}", payment.amount, total);
                notes = Some(match notes {
                    Some(n) => format!("{}; {}", n, mismatch),
                    None => mismatch,
                });
            }
        }

        let now = OffsetDateTime::now_utc();
        payment.status = update.status;
        payment.updated_at = now;
        if update.payment_key.is_some() {
            payment.payment_key = update.payment_key.clone();
        }
        if update.method.is_some() {
            payment.method = update.method.clone();
        }
        payment.status_history.push(StatusHistoryEntry {
            status: update.status,
            timestamp: now,
            source: update.source,
            notes,
            payment_key: update.payment_key.clone(),
        });

        // Merge over the stored body so fields this type does not model survive
        let mut body = doc.body.clone();
        classbook_shared::merge_top_level(&mut body, &to_body(&payment)?)?;
        self.store
            .replace(collections::PAYMENTS, doc.id, doc.version, body)
            .await?;

        Ok(Some(StatusUpdate {
            payment,
            previous_status,
            applied: true,
        }))
    }

    /// Mark the student as paid and add purchased credits, then stamp the
    /// payment's `creditedAt`.
    ///
    /// A missing student is logged and skipped; the payment stays uncredited.
    pub async fn apply_completion(&self, payment: &Payment) -> BillingResult<Option<Student>> {
        let strategy = ExponentialBackoff::from_millis(10)
            .map(jitter)
            .take(MAX_WRITE_ATTEMPTS - 1);

        let student = RetryIf::spawn(
            strategy,
            || self.try_apply_completion(payment),
            |e: &BillingError| e.is_conflict(),
        )
        .await?;

        match &student {
            Some(_) => self.mark_credited(&payment.order_id).await?,
            None => tracing::warn!(
                order_id = %payment.order_id,
                student = %payment.student_name,
                "Completed payment references an unknown student"
            ),
        }
        Ok(student)
    }

    async fn mark_credited(&self, order_id: &str) -> BillingResult<()> {
        let Some((doc, _)) = self.find_payment(order_id).await? else {
            return Ok(());
        };
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        self.store
            .merge(collections::PAYMENTS, doc.id, json!({"creditedAt": stamp}))
            .await?;
        Ok(())
    }

    async fn try_apply_completion(&self, payment: &Payment) -> BillingResult<Option<Student>> {
        let Some(doc) = self
            .store
            .find_one(
                collections::STUDENTS,
                &Filter::new().eq("name", payment.student_name.as_str()),
            )
            .await?
        else {
            return Ok(None);
        };

        let mut student = doc.decode::<Student>()?;
        if student.order_id.as_deref() == Some(payment.order_id.as_str()) {
            // Already credited by an earlier attempt
            return Ok(Some(student));
        }
        student.payment_status = Some(payment_status::PAID.to_string());
        student.order_id = Some(payment.order_id.clone());
        student.payment_id = payment.payment_key.clone();
        if let Some(credits) = payment.purchased_credits() {
            student.credits += credits;
        }

        self.store
            .replace(collections::STUDENTS, doc.id, doc.version, to_body(&student)?)
            .await?;

        tracing::info!(
            student = %student.name,
            credits = student.credits,
            order_id = %payment.order_id,
            "Student marked as paid"
        );
        Ok(Some(student))
    }
}
