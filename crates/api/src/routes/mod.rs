//! API routes

pub mod billing;
pub mod health;
pub mod payments;
pub mod resources;
pub mod students;
pub mod tts;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Path, Query,
    },
    http::{HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Unwrap a JSON body, reporting malformed input in the API error format
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Unwrap query parameters, reporting bad input in the API error format
pub(crate) fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Unwrap path parameters, reporting bad input in the API error format
pub(crate) fn path_param<T>(path: Result<Path<T>, PathRejection>) -> ApiResult<T> {
    path.map(|Path(param)| param)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Parse a document id from a path segment
pub(crate) fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid id", raw)))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let payment_routes = Router::new()
        .route("/", post(payments::create_payment))
        .route("/confirm", post(payments::confirm_payment))
        .route("/success", get(payments::payment_success))
        .route("/fail", get(payments::payment_fail))
        .route("/webhook", post(payments::webhook))
        .route("/:order_id", get(payments::get_payment))
        .route("/:order_id/status", post(payments::update_status))
        .route("/:order_id/sync", post(payments::sync_payment));

    let billing_routes = Router::new()
        .route("/check1", post(billing::save_check1).get(billing::get_check1))
        .route("/check2", post(billing::save_check2).get(billing::get_check2))
        .route("/status", post(billing::record_step).get(billing::list_status));

    let mut api_routes = Router::new()
        .nest("/payments", payment_routes)
        .nest("/billing", billing_routes)
        .route("/tts", post(tts::synthesize));

    for resource in resources::RESOURCES {
        let mut routes = resources::resource_routes(resource);
        if resource.collection == classbook_shared::collections::STUDENTS {
            routes = routes.route("/:id/credits", post(students::adjust_credits));
        }
        api_routes = api_routes.nest(resource.path, routes);
    }

    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB global limit
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
