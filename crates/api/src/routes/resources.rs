//! CRUD routes for the flat document collections
//!
//! Each resource is mounted at `/api/<path>` with list, create, get, update
//! (top-level merge) and delete. Lists filter on `?field=value` equality.

use std::collections::HashMap;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    routing::get,
    Json, Router,
};
use classbook_shared::{
    collections, merge_top_level, Document, DocumentStore, Filter, Student, Teacher,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    routes::{json_body, parse_id, path_param, query_params},
    state::AppState,
};

pub type Validator = fn(&Value) -> ApiResult<()>;

/// A CRUD-exposed collection
pub struct Resource {
    pub collection: &'static str,
    pub path: &'static str,
    /// Fields that must be non-empty strings on create
    pub required: &'static [&'static str],
    /// Shape check for typed collections, run on create and on the merged
    /// document before an update is written
    pub validate: Option<Validator>,
}

fn decodes_as<T: DeserializeOwned>(body: &Value) -> ApiResult<()> {
    serde_json::from_value::<T>(body.clone())
        .map(|_| ())
        .map_err(|e| ApiError::Validation(e.to_string()))
}

pub const RESOURCES: &[Resource] = &[
    Resource {
        collection: collections::STUDENTS,
        path: "/students",
        required: &["name"],
        validate: Some(decodes_as::<Student>),
    },
    Resource {
        collection: collections::TEACHERS,
        path: "/teachers",
        required: &["name"],
        validate: Some(decodes_as::<Teacher>),
    },
    Resource {
        collection: collections::CLASSNOTES,
        path: "/classnotes",
        required: &[],
        validate: None,
    },
    Resource {
        collection: collections::DIARIES,
        path: "/diaries",
        required: &[],
        validate: None,
    },
    Resource {
        collection: collections::QUIZLETS,
        path: "/quizlets",
        required: &[],
        validate: None,
    },
    Resource {
        collection: collections::BANNERS,
        path: "/banners",
        required: &[],
        validate: None,
    },
    Resource {
        collection: collections::POPUPS,
        path: "/popups",
        required: &[],
        validate: None,
    },
];

/// Store-managed keys a client may not write
const RESERVED_KEYS: &[&str] = &["id", "version"];

pub fn resource_routes(resource: &'static Resource) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(
                move |state: State<AppState>,
                      query: Result<Query<HashMap<String, String>>, QueryRejection>| {
                    list(resource, state, query)
                },
            )
            .post(move |state: State<AppState>, payload: Result<Json<Value>, JsonRejection>| {
                create(resource, state, payload)
            }),
        )
        .route(
            "/:id",
            get(move |state: State<AppState>, id: Result<Path<String>, PathRejection>| {
                fetch(resource, state, id)
            })
            .put(
                move |state: State<AppState>,
                      id: Result<Path<String>, PathRejection>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    update(resource, state, id, payload)
                },
            )
            .patch(
                move |state: State<AppState>,
                      id: Result<Path<String>, PathRejection>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    update(resource, state, id, payload)
                },
            )
            .delete(move |state: State<AppState>, id: Result<Path<String>, PathRejection>| {
                remove(resource, state, id)
            }),
        )
}

/// Query values compare as strings, except `true`/`false` which compare as booleans
fn query_filter(query: HashMap<String, String>) -> Filter {
    query.into_iter().fold(Filter::new(), |filter, (field, value)| {
        match value.as_str() {
            "true" => filter.eq(field, true),
            "false" => filter.eq(field, false),
            _ => filter.eq(field, value),
        }
    })
}

fn clean_body(body: Value) -> ApiResult<Value> {
    let Value::Object(mut map) = body else {
        return Err(ApiError::Validation("request body must be a JSON object".to_string()));
    };
    for key in RESERVED_KEYS {
        map.remove(*key);
    }
    Ok(Value::Object(map))
}

async fn list(
    resource: &'static Resource,
    State(state): State<AppState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let query = query_params(query)?;
    let docs = state.store.find(resource.collection, &query_filter(query)).await?;
    let items: Vec<Value> = docs.iter().map(|d| d.to_json()).collect();
    Ok(Json(json!({"ok": true, "count": items.len(), "items": items})))
}

async fn create(
    resource: &'static Resource,
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = clean_body(json_body(payload)?)?;
    for field in resource.required {
        let present = body
            .get(*field)
            .and_then(Value::as_str)
            .is_some_and(|v| !v.trim().is_empty());
        if !present {
            return Err(ApiError::Validation(format!("{} is required", field)));
        }
    }
    if let Some(validate) = resource.validate {
        validate(&body)?;
    }

    let doc = state.store.insert(resource.collection, body).await?;
    tracing::info!(collection = resource.collection, id = %doc.id, "Document created");
    Ok(Json(json!({"ok": true, "item": doc.to_json()})))
}

async fn fetch(
    resource: &'static Resource,
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let doc = state
        .store
        .get(resource.collection, parse_id(&path_param(id)?)?)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({"ok": true, "item": doc.to_json()})))
}

async fn update(
    resource: &'static Resource,
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&path_param(id)?)?;
    let patch = clean_body(json_body(payload)?)?;
    for field in resource.required {
        if let Some(value) = patch.get(*field) {
            if !value.as_str().is_some_and(|v| !v.trim().is_empty()) {
                return Err(ApiError::Validation(format!("{} cannot be empty", field)));
            }
        }
    }

    let doc = match resource.validate {
        None => state
            .store
            .merge(resource.collection, id, patch)
            .await?
            .ok_or(ApiError::NotFound)?,
        Some(validate) => {
            let strategy = ExponentialBackoff::from_millis(10).map(jitter).take(3);
            RetryIf::spawn(
                strategy,
                || merge_checked(state.store.as_ref(), resource.collection, id, &patch, validate),
                |e: &ApiError| matches!(e, ApiError::Conflict(_)),
            )
            .await?
        }
    };
    Ok(Json(json!({"ok": true, "item": doc.to_json()})))
}

/// Merge `patch` into a typed document only if the result still validates
async fn merge_checked(
    store: &dyn DocumentStore,
    collection: &str,
    id: Uuid,
    patch: &Value,
    validate: Validator,
) -> ApiResult<Document> {
    let doc = store.get(collection, id).await?.ok_or(ApiError::NotFound)?;
    let mut body = doc.body.clone();
    merge_top_level(&mut body, patch)?;
    validate(&body)?;
    Ok(store.replace(collection, doc.id, doc.version, body).await?)
}

async fn remove(
    resource: &'static Resource,
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&path_param(id)?)?;
    if !state.store.delete(resource.collection, id).await? {
        return Err(ApiError::NotFound);
    }
    tracing::info!(collection = resource.collection, id = %id, "Document deleted");
    Ok(Json(json!({"ok": true, "deleted": id})))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::{create_router, test_support::*};

    #[tokio::test]
    async fn test_student_crud_round() {
        let app = create_router(test_state());

        let (status, created) = send(
            &app,
            "POST",
            "/api/students",
            Some(json!({"name": "Ann", "phoneNumber": "010-1234-5678", "credits": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["item"]["id"].as_str().unwrap().to_string();

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/api/students/{}", id),
            Some(json!({"hourlyRate": 30000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["item"]["hourlyRate"], 30000);
        assert_eq!(updated["item"]["phoneNumber"], "010-1234-5678");

        let (_, fetched) = send(&app, "GET", &format!("/api/students/{}", id), None).await;
        assert_eq!(fetched["item"]["name"], "Ann");

        let (status, _) = send(&app, "DELETE", &format!("/api/students/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "GET", &format!("/api/students/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_required_name() {
        let app = create_router(test_state());
        for path in ["/api/students", "/api/teachers"] {
            let (status, body) = send(&app, "POST", path, Some(json!({"phoneNumber": "010"}))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", path);
            assert_eq!(body["error"]["message"], "name is required");
        }

        // Collections without required fields accept any object
        let (status, _) = send(&app, "POST", "/api/diaries", Some(json!({"text": "rainy day"}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_filters_by_query() {
        let app = create_router(test_state());
        send(&app, "POST", "/api/classnotes", Some(json!({"student_name": "Ann", "note": "a"}))).await;
        send(&app, "POST", "/api/classnotes", Some(json!({"student_name": "Ben", "note": "b"}))).await;
        send(&app, "POST", "/api/popups", Some(json!({"title": "Holiday", "active": true}))).await;

        let (_, all) = send(&app, "GET", "/api/classnotes", None).await;
        assert_eq!(all["count"], 2);

        let (_, ann) = send(&app, "GET", "/api/classnotes?student_name=Ann", None).await;
        assert_eq!(ann["count"], 1);
        assert_eq!(ann["items"][0]["note"], "a");

        let (_, active) = send(&app, "GET", "/api/popups?active=true", None).await;
        assert_eq!(active["count"], 1);
    }

    #[tokio::test]
    async fn test_bad_ids_and_missing_documents() {
        let app = create_router(test_state());
        let (status, _) = send(&app, "GET", "/api/banners/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = uuid::Uuid::new_v4();
        let (status, _) = send(&app, "PATCH", &format!("/api/quizlets/{}", missing), Some(json!({"a": 1}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &format!("/api/quizlets/{}", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_student_shape_checked() {
        let app = create_router(test_state());
        let (status, body) = send(
            &app,
            "POST",
            "/api/students",
            Some(json!({"name": "Ann", "credits": "many"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_non_object_body_rejected() {
        let app = create_router(test_state());
        let (status, _) = send(&app, "POST", "/api/banners", Some(json!(["x"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_student_update_must_keep_shape() {
        let app = create_router(test_state());
        let (_, created) = send(&app, "POST", "/api/students", Some(json!({"name": "Ann", "credits": 3}))).await;
        let id = created["item"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/students/{}", id);

        let (status, body) = send(&app, "PATCH", &uri, Some(json!({"credits": "many"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (_, fetched) = send(&app, "GET", &uri, None).await;
        assert_eq!(fetched["item"]["credits"], 3);

        // The stored student still decodes for credit adjustments
        let (status, adjusted) = send(&app, "POST", &format!("{}/credits", uri), Some(json!({"delta": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(adjusted["credits"], 4);

        let (status, _) = send(&app, "PUT", &uri, Some(json!({"credits": 10, "memo": "bundle"}))).await;
        assert_eq!(status, StatusCode::OK);
    }
}
