//! Monthly billing routes: check1/check2 confirmations and the status log

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Json,
};
use classbook_billing::{BillingStep, CheckKind};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    routes::{json_body, query_params},
    state::AppState,
};

async fn save_check(state: &AppState, kind: CheckKind, body: Value) -> ApiResult<Json<Value>> {
    if !body.is_object() {
        return Err(ApiError::Validation("request body must be a JSON object".to_string()));
    }
    let saved = state.billing.checks.save_check(kind, &body).await?;
    Ok(Json(json!({
        "ok": true,
        "yyyymm": saved.month_key.yyyymm,
        "monthSource": saved.month_key.source,
        "detail": saved.detail.to_json(),
        "status": saved.status.to_json(),
    })))
}

/// Teacher-side confirmation
pub async fn save_check1(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    save_check(&state, CheckKind::Check1, json_body(payload)?).await
}

/// Admin-side confirmation
pub async fn save_check2(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    save_check(&state, CheckKind::Check2, json_body(payload)?).await
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub yyyymm: Option<String>,
}

async fn get_check(state: &AppState, kind: CheckKind, query: CheckQuery) -> ApiResult<Json<Value>> {
    match (query.student_name.as_deref(), query.yyyymm.as_deref()) {
        (Some(student), Some(yyyymm)) => {
            let doc = state
                .billing
                .checks
                .get_check(kind, student, yyyymm)
                .await?
                .ok_or(ApiError::NotFound)?;
            Ok(Json(json!({"ok": true, "detail": doc.to_json()})))
        }
        (student, yyyymm) => {
            let docs = state.billing.checks.list_checks(kind, yyyymm).await?;
            let items: Vec<Value> = docs
                .iter()
                .filter(|d| student.map_or(true, |s| d.str_field("student_name") == Some(s)))
                .map(|d| d.to_json())
                .collect();
            Ok(Json(json!({"ok": true, "count": items.len(), "items": items})))
        }
    }
}

pub async fn get_check1(
    State(state): State<AppState>,
    query: Result<Query<CheckQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    get_check(&state, CheckKind::Check1, query).await
}

pub async fn get_check2(
    State(state): State<AppState>,
    query: Result<Query<CheckQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    get_check(&state, CheckKind::Check2, query).await
}

/// Append a workflow step (payment or message confirmation, or a manual step)
pub async fn record_step(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = json_body(payload)?;

    let step_name = body
        .get("step")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Validation("step is required".to_string()))?;
    let step = BillingStep::from_str(step_name)
        .ok_or_else(|| ApiError::Validation(format!("unknown billing step '{}'", step_name)))?;
    let student_name = body
        .get("student_name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("student_name is required".to_string()))?;

    let month_key = state.billing.checks.month_key_for(&body);
    let doc = state
        .billing
        .checks
        .record_step(
            step,
            student_name,
            &month_key.yyyymm,
            body.get("savedBy").and_then(Value::as_str),
            body.get("meta").cloned().unwrap_or(Value::Null),
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "yyyymm": month_key.yyyymm,
        "status": doc.to_json(),
    })))
}

/// Status rows plus the latest step per student
pub async fn list_status(
    State(state): State<AppState>,
    query: Result<Query<CheckQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    let rows = state
        .billing
        .checks
        .list_status(query.yyyymm.as_deref(), query.student_name.as_deref())
        .await?;

    let latest = match query.yyyymm.as_deref() {
        Some(yyyymm) => {
            let mut latest = state.billing.checks.latest_steps(yyyymm).await?;
            if let Some(student) = query.student_name.as_deref() {
                latest.retain(|name, _| name == student);
            }
            serde_json::to_value(latest).map_err(|_| ApiError::Internal)?
        }
        None => Value::Null,
    };

    Ok(Json(json!({
        "ok": true,
        "count": rows.len(),
        "rows": rows,
        "latest": latest,
    })))
}
