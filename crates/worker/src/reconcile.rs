//! Billing reconciliation pass
//!
//! Repairs billing details whose status row is missing, retries the student
//! update for completed payments that never got it, and reports payments
//! stuck in `INITIATED`. Stale payments are only logged; the gateway remains
//! the authority on whether they were paid.

use classbook_billing::{BillingResult, BillingService, CheckKind};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

#[derive(Debug, Default, Serialize)]
pub struct RepairedRow {
    pub collection: &'static str,
    pub student_name: String,
    pub yyyymm: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub repaired: Vec<RepairedRow>,
    /// Completed payments whose student was marked paid on this pass
    pub credited: Vec<String>,
    pub stale_payments: Vec<String>,
}

/// Run one reconciliation pass
pub async fn run_once(billing: &BillingService, stale_after: Duration) -> BillingResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for kind in CheckKind::all() {
        let repaired = billing.checks.reconcile_status_log(kind).await?;
        report
            .repaired
            .extend(repaired.into_iter().map(|(student_name, yyyymm)| RepairedRow {
                collection: kind.collection(),
                student_name,
                yyyymm,
            }));
    }

    for payment in billing.payments.uncredited_payments().await? {
        match billing.payments.apply_completion(&payment).await {
            Ok(Some(_)) => {
                info!(order_id = %payment.order_id, student = %payment.student_name, "Credited completed payment");
                report.credited.push(payment.order_id);
            }
            Ok(None) => {}
            Err(e) => error!(order_id = %payment.order_id, error = %e, "Failed to credit completed payment"),
        }
    }

    let cutoff = OffsetDateTime::now_utc() - stale_after;
    for payment in billing.payments.stale_payments(cutoff).await? {
        warn!(
            order_id = %payment.order_id,
            student = %payment.student_name,
            amount = payment.amount,
            created_at = %payment.created_at,
            "Payment still INITIATED past the stale threshold"
        );
        report.stale_payments.push(payment.order_id);
    }

    info!(
        repaired = report.repaired.len(),
        credited = report.credited.len(),
        stale_payments = report.stale_payments.len(),
        "Reconciliation pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use classbook_billing::{GatewayUpdate, NewPayment, OrderIdAllocator, PaymentStatus, UpdateSource};
    use classbook_shared::{collections, DocumentStore, MemoryDocumentStore};
    use serde_json::json;

    fn billing(store: Arc<MemoryDocumentStore>) -> BillingService {
        BillingService::new(store, None, OrderIdAllocator::default(), 9)
    }

    #[tokio::test]
    async fn test_repairs_missing_rows_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        let billing = billing(store.clone());

        billing
            .checks
            .save_check(CheckKind::Check1, &json!({"student_name": "Ann", "yyyymm": "202505"}))
            .await
            .unwrap();
        // Detail written without its status row
        store
            .insert(
                collections::BILLING_CHECK2,
                json!({"student_name": "Ben", "yyyymm": "202505"}),
            )
            .await
            .unwrap();

        let report = run_once(&billing, Duration::hours(24)).await.unwrap();
        assert_eq!(report.repaired.len(), 1);
        assert_eq!(report.repaired[0].student_name, "Ben");
        assert_eq!(report.repaired[0].collection, collections::BILLING_CHECK2);

        let again = run_once(&billing, Duration::hours(24)).await.unwrap();
        assert!(again.repaired.is_empty());
        assert_eq!(store.count(collections::BILLING_STATUS).await, 2);
    }

    #[tokio::test]
    async fn test_reports_stale_payments() {
        let store = Arc::new(MemoryDocumentStore::new());
        let billing = billing(store.clone());
        billing
            .payments
            .create_payment(NewPayment {
                order_id: "ORD-stale-1".to_string(),
                student_name: "Ann".to_string(),
                amount: 1000,
                currency: "KRW".to_string(),
                metadata: json!({}),
            })
            .await
            .unwrap();

        // Negative threshold puts the cutoff in the future
        let report = run_once(&billing, Duration::hours(-1)).await.unwrap();
        assert_eq!(report.stale_payments, vec!["ORD-stale-1".to_string()]);

        let report = run_once(&billing, Duration::hours(24)).await.unwrap();
        assert!(report.stale_payments.is_empty());
    }

    #[tokio::test]
    async fn test_credits_completed_payment_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        let billing = billing(store.clone());
        billing
            .payments
            .create_payment(NewPayment {
                order_id: "ORD-late-1".to_string(),
                student_name: "Ann".to_string(),
                amount: 1000,
                currency: "KRW".to_string(),
                metadata: json!({"credits": 3}),
            })
            .await
            .unwrap();
        // Completed before the student record existed, so nothing was credited
        billing
            .apply_update("ORD-late-1", GatewayUpdate::new(PaymentStatus::Done, UpdateSource::Webhook))
            .await
            .unwrap();
        store
            .insert(collections::STUDENTS, json!({"name": "Ann", "credits": 1}))
            .await
            .unwrap();

        let report = run_once(&billing, Duration::hours(24)).await.unwrap();
        assert_eq!(report.credited, vec!["ORD-late-1".to_string()]);

        let again = run_once(&billing, Duration::hours(24)).await.unwrap();
        assert!(again.credited.is_empty());

        let student = store
            .find_one(collections::STUDENTS, &classbook_shared::Filter::new().eq("name", "Ann"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(student.body["credits"], 4);
        assert_eq!(student.body["orderId"], "ORD-late-1");
    }
}
