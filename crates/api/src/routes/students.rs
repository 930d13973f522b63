//! Student credit adjustments

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};
use classbook_shared::{collections, to_body, DocumentStore, Student};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    routes::{json_body, parse_id, path_param},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreditAdjustment {
    pub delta: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Add `delta` (possibly negative) to a student's remaining classes
pub async fn adjust_credits(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    payload: Result<Json<CreditAdjustment>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&path_param(id)?)?;
    let req = json_body(payload)?;
    if req.delta == 0 {
        return Err(ApiError::Validation("delta must be non-zero".to_string()));
    }

    let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(3);
    let student = RetryIf::spawn(
        strategy,
        || apply_delta(state.store.as_ref(), id, req.delta),
        |e: &ApiError| matches!(e, ApiError::Conflict(_)),
    )
    .await?;

    tracing::info!(
        student = %student.name,
        delta = req.delta,
        credits = student.credits,
        reason = ?req.reason,
        "Student credits adjusted"
    );
    Ok(Json(json!({"ok": true, "id": id, "credits": student.credits})))
}

async fn apply_delta(store: &dyn DocumentStore, id: Uuid, delta: i64) -> ApiResult<Student> {
    let doc = store
        .get(collections::STUDENTS, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let mut student = doc.decode::<Student>()?;

    let credits = student
        .credits
        .checked_add(delta)
        .filter(|c| *c >= 0)
        .ok_or_else(|| {
            ApiError::Validation(format!(
                "credits cannot go below zero (current {}, delta {})",
                student.credits, delta
            ))
        })?;
    student.credits = credits;

    store
        .replace(collections::STUDENTS, doc.id, doc.version, to_body(&student)?)
        .await?;
    Ok(student)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::{create_router, test_support::*};

    #[tokio::test]
    async fn test_adjust_credits() {
        let app = create_router(test_state());
        let (_, created) = send(&app, "POST", "/api/students", Some(json!({"name": "Ann", "credits": 2}))).await;
        let id = created["item"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/students/{}/credits", id);

        let (status, body) = send(&app, "POST", &uri, Some(json!({"delta": 4, "reason": "bundle"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits"], 6);

        let (_, body) = send(&app, "POST", &uri, Some(json!({"delta": -1}))).await;
        assert_eq!(body["credits"], 5);

        let (status, _) = send(&app, "POST", &uri, Some(json!({"delta": -10}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, fetched) = send(&app, "GET", &format!("/api/students/{}", id), None).await;
        assert_eq!(fetched["item"]["credits"], 5);
        assert_eq!(fetched["item"]["name"], "Ann");
    }

    #[tokio::test]
    async fn test_adjust_credits_unknown_student() {
        let app = create_router(test_state());
        let uri = format!("/api/students/{}/credits", uuid::Uuid::new_v4());
        let (status, _) = send(&app, "POST", &uri, Some(json!({"delta": 1}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
