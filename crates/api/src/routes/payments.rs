//! Payment routes
//!
//! Link generation, the gateway's redirect-back endpoints, confirmation,
//! webhooks and manual status changes.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::HeaderMap,
    Json,
};
use classbook_billing::{
    GatewayUpdate, PaymentLinkInput, PaymentStatus, StatusUpdate, UpdateSource, SIGNATURE_HEADER,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    error::{ApiError, ApiResult},
    routes::{json_body, path_param, query_params},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default, alias = "orderName")]
    pub order_name: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Classes purchased; added to the student's credits on completion
    #[serde(default)]
    pub credits: Option<i64>,
    #[serde(default)]
    pub yyyymm: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Generate a payment link
pub async fn create_payment(
    State(state): State<AppState>,
    payload: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = json_body(payload)?;

    let student_name = req
        .student_name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Validation("student_name is required".to_string()))?;
    let amount = req
        .amount
        .filter(|a| *a > 0)
        .ok_or_else(|| ApiError::Validation("amount must be a positive integer".to_string()))?;

    let mut metadata = req.metadata.unwrap_or_default();
    if let Some(credits) = req.credits {
        metadata.insert("credits".to_string(), json!(credits));
    }
    if let Some(yyyymm) = req.yyyymm {
        metadata.insert("yyyymm".to_string(), json!(yyyymm));
    }

    let link = state
        .billing
        .generate_payment_link(PaymentLinkInput {
            student_name,
            amount,
            order_name: req.order_name,
            method: req.method,
            currency: req.currency,
            metadata: Value::Object(metadata),
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "orderId": link.order_id,
        "checkoutUrl": link.checkout_url,
        "recorded": link.recorded,
    })))
}

/// Fetch a payment record by order id
pub async fn get_payment(
    State(state): State<AppState>,
    order_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let order_id = path_param(order_id)?;
    let (doc, _) = state
        .billing
        .payments
        .find_payment(&order_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({"ok": true, "payment": doc.to_json()})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

fn outcome_json(order_id: &str, outcome: Option<&StatusUpdate>) -> Value {
    match outcome {
        Some(o) => json!({
            "ok": true,
            "orderId": order_id,
            "updated": o.applied,
            "status": o.payment.status,
            "previousStatus": o.previous_status,
        }),
        None => json!({"ok": true, "orderId": order_id, "updated": false}),
    }
}

/// Confirm a payment with the gateway
pub async fn confirm_payment(
    State(state): State<AppState>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = json_body(payload)?;
    let (_, outcome) = state
        .billing
        .confirm_payment(&req.payment_key, &req.order_id, req.amount, UpdateSource::Confirm)
        .await?;
    Ok(Json(outcome_json(&req.order_id, outcome.as_ref())))
}

/// Redirect-back target after a successful payment window
pub async fn payment_success(
    State(state): State<AppState>,
    query: Result<Query<ConfirmRequest>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    let (_, outcome) = state
        .billing
        .confirm_payment(&query.payment_key, &query.order_id, query.amount, UpdateSource::Redirect)
        .await?;
    Ok(Json(outcome_json(&query.order_id, outcome.as_ref())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailQuery {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Redirect-back target after a failed or cancelled payment window
pub async fn payment_fail(
    State(state): State<AppState>,
    query: Result<Query<FailQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    let Some(order_id) = query.order_id else {
        tracing::warn!(code = ?query.code, "Payment failure redirect without orderId");
        return Ok(Json(json!({"ok": true, "updated": false, "code": query.code})));
    };
    let outcome = state
        .billing
        .record_failure(&order_id, query.code.as_deref(), query.message.as_deref())
        .await?;
    let mut body = outcome_json(&order_id, outcome.as_ref());
    body["code"] = json!(query.code);
    body["message"] = json!(query.message);
    Ok(Json(body))
}

/// Gateway webhook
///
/// Unknown order ids are acknowledged with 200 so the gateway stops retrying.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let (payload, outcome) = state.billing.handle_webhook(&body, signature).await?;
    Ok(Json(outcome_json(&payload.order_id, outcome.as_ref())))
}

#[derive(Debug, Deserialize)]
pub struct ManualStatusRequest {
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "paymentKey")]
    pub payment_key: Option<String>,
}

/// Manually set a payment's status
pub async fn update_status(
    State(state): State<AppState>,
    order_id: Result<Path<String>, PathRejection>,
    payload: Result<Json<ManualStatusRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let order_id = path_param(order_id)?;
    let req = json_body(payload)?;
    let status = PaymentStatus::from_gateway(&req.status)
        .ok_or_else(|| ApiError::Validation(format!("unknown payment status '{}'", req.status)))?;

    let update = GatewayUpdate {
        notes: req.notes,
        payment_key: req.payment_key,
        ..GatewayUpdate::new(status, UpdateSource::Manual)
    };
    let outcome = state
        .billing
        .apply_update(&order_id, update)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(outcome_json(&order_id, Some(&outcome))))
}

/// Pull the gateway's view of an order and apply it
pub async fn sync_payment(
    State(state): State<AppState>,
    order_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let order_id = path_param(order_id)?;
    let outcome = state.billing.sync_payment(&order_id).await?;
    Ok(Json(outcome_json(&order_id, outcome.as_ref())))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use classbook_billing::NewPayment;
    use classbook_shared::collections;
    use serde_json::json;

    use crate::routes::{create_router, test_support::*};

    async fn seed(state: &crate::state::AppState, order_id: &str) {
        state
            .billing
            .payments
            .create_payment(NewPayment {
                order_id: order_id.to_string(),
                student_name: "Ann".to_string(),
                amount: 50000,
                currency: "KRW".to_string(),
                metadata: json!({"credits": 4}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_payment_requires_fields() {
        let app = create_router(test_state());

        let (status, body) = send(&app, "POST", "/api/payments", Some(json!({"amount": 1000}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            "POST",
            "/api/payments",
            Some(json!({"student_name": "Ann", "amount": -5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_payment_without_gateway_is_unavailable() {
        let app = create_router(test_state());
        let (status, body) = send(
            &app,
            "POST",
            "/api/payments",
            Some(json!({"student_name": "Ann", "amount": 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_webhook_unknown_order_is_acknowledged() {
        let state = test_state();
        let app = create_router(state.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/api/payments/webhook",
            Some(json!({"orderId": "ORD-unknown-1", "status": "DONE", "paymentKey": "pk"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["updated"], false);
        let payments = state
            .store
            .find(collections::PAYMENTS, &classbook_shared::Filter::new())
            .await
            .unwrap();
        assert!(payments.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_redelivery_is_idempotent() {
        let state = test_state();
        seed(&state, "ORD-hook-1").await;
        let app = create_router(state.clone());
        let event = json!({"orderId": "ORD-hook-1", "status": "DONE", "paymentKey": "pk_1", "totalAmount": 50000});

        let (_, first) = send(&app, "POST", "/api/payments/webhook", Some(event.clone())).await;
        let (_, second) = send(&app, "POST", "/api/payments/webhook", Some(event)).await;
        assert_eq!(first["updated"], true);
        assert_eq!(first["status"], "DONE");
        assert_eq!(second["updated"], false);

        let (status, body) = send(&app, "GET", "/api/payments/ORD-hook-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payment"]["statusHistory"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_rejects_malformed_body() {
        let app = create_router(test_state());
        let (status, body) = send(&app, "POST", "/api/payments/webhook", Some(json!({"status": "DONE"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_manual_status_update() {
        let state = test_state();
        seed(&state, "ORD-manual-1").await;
        let app = create_router(state);

        let (status, body) = send(
            &app,
            "POST",
            "/api/payments/ORD-manual-1/status",
            Some(json!({"status": "CANCELED", "notes": "refunded at desk"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELED");
        assert_eq!(body["previousStatus"], "INITIATED");

        let (status, _) = send(
            &app,
            "POST",
            "/api/payments/ORD-missing-1/status",
            Some(json!({"status": "DONE"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "POST",
            "/api/payments/ORD-manual-1/status",
            Some(json!({"status": "SOMETHING"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fail_redirect_marks_payment() {
        let state = test_state();
        seed(&state, "ORD-fail-1").await;
        let app = create_router(state);

        let (status, body) = send(
            &app,
            "GET",
            "/api/payments/fail?orderId=ORD-fail-1&code=PAY_PROCESS_CANCELED&message=closed",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELED");
        assert_eq!(body["code"], "PAY_PROCESS_CANCELED");
    }

    #[tokio::test]
    async fn test_get_unknown_payment_is_404() {
        let app = create_router(test_state());
        let (status, body) = send(&app, "GET", "/api/payments/ORD-none-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_success_redirect_without_payment_key_is_json_error() {
        let app = create_router(test_state());
        let (status, body) = send(&app, "GET", "/api/payments/success?orderId=ORD-x-123", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_success_redirect_confirms_with_gateway() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payments/confirm")
            .match_body(mockito::Matcher::Json(json!({
                "paymentKey": "pk_1",
                "orderId": "ORD-redirect-1",
                "amount": 50000
            })))
            .with_status(200)
            .with_body(r#"{"paymentKey":"pk_1","orderId":"ORD-redirect-1","status":"DONE","method":"CARD","totalAmount":50000}"#)
            .create_async()
            .await;
        let state = gateway_state(server.url());
        seed(&state, "ORD-redirect-1").await;
        let app = create_router(state);

        let (status, body) = send(
            &app,
            "GET",
            "/api/payments/success?paymentKey=pk_1&orderId=ORD-redirect-1&amount=50000",
            None,
        )
        .await;
        mock.assert_async().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "DONE");
        assert_eq!(body["updated"], true);

        let (_, fetched) = send(&app, "GET", "/api/payments/ORD-redirect-1", None).await;
        assert_eq!(fetched["payment"]["statusHistory"][1]["source"], "redirect");
    }

    #[tokio::test]
    async fn test_confirm_surfaces_gateway_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("POST", "/v1/payments/confirm")
            .match_body(mockito::Matcher::PartialJson(json!({"orderId": "ORD-confirm-1"})))
            .with_status(200)
            .with_body(r#"{"paymentKey":"pk_2","orderId":"ORD-confirm-1","status":"DONE","totalAmount":50000}"#)
            .create_async()
            .await;
        let _rejected = server
            .mock("POST", "/v1/payments/confirm")
            .match_body(mockito::Matcher::PartialJson(json!({"orderId": "ORD-confirm-2"})))
            .with_status(400)
            .with_body(r#"{"code":"REJECT_CARD_COMPANY","message":"declined"}"#)
            .create_async()
            .await;
        let state = gateway_state(server.url());
        seed(&state, "ORD-confirm-1").await;
        seed(&state, "ORD-confirm-2").await;
        let app = create_router(state);

        let (status, body) = send(
            &app,
            "POST",
            "/api/payments/confirm",
            Some(json!({"paymentKey": "pk_2", "orderId": "ORD-confirm-1", "amount": 50000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "DONE");
        assert_eq!(body["previousStatus"], "INITIATED");

        let (status, body) = send(
            &app,
            "POST",
            "/api/payments/confirm",
            Some(json!({"paymentKey": "pk_3", "orderId": "ORD-confirm-2", "amount": 50000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "REJECT_CARD_COMPANY");

        let (_, fetched) = send(&app, "GET", "/api/payments/ORD-confirm-2", None).await;
        assert_eq!(fetched["payment"]["status"], "INITIATED");
    }

    #[tokio::test]
    async fn test_sync_pulls_gateway_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/orders/ORD-sync-1")
            .with_status(200)
            .with_body(r#"{"paymentKey":"pk_5","orderId":"ORD-sync-1","status":"CANCELED"}"#)
            .create_async()
            .await;
        let state = gateway_state(server.url());
        seed(&state, "ORD-sync-1").await;
        let app = create_router(state);

        let (status, body) = send(&app, "POST", "/api/payments/ORD-sync-1/sync", None).await;
        mock.assert_async().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELED");
        assert_eq!(body["updated"], true);
    }

    #[tokio::test]
    async fn test_sync_rejects_malformed_order_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let app = create_router(gateway_state(server.url()));

        let (status, body) = send(&app, "POST", "/api/payments/..%2F..%2Fv1%2Fbilling/sync", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        mock.assert_async().await;
    }
}
