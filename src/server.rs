//! Axum router construction.
//!
//! The [`app`] function wires every route to its handler, adds the request
//! ID, metrics, CORS, tracing and timeout layers, and returns a router
//! ready for [`crate::lifecycle::start`].

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::{RequestBodyTimeoutLayer, ResponseBodyTimeoutLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, with_request_id, REQUEST_ID_HEADER};
use crate::handlers::{bucket, object};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI document ---------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "bucketproxy",
        version = "0.1.0",
        description = "HTTP front end for an S3-compatible object store"
    ),
    paths(
        health_check,
        bucket::list_buckets,
        bucket::list_objects,
        object::upload_object,
        object::download_object,
        object::simple_upload,
        object::simple_download,
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Buckets", description = "Bucket listings"),
        (name = "Objects", description = "Object upload and download"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every route and middleware layer.
pub fn app(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let metrics_enabled = state.config.observability.metrics;

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json))
        .route("/s3/buckets", get(bucket::list_buckets))
        .route(
            "/s3/buckets/:bucket",
            get(bucket::list_objects)
                .post(object::upload_object)
                .put(object::upload_object),
        )
        .route("/s3/buckets/:bucket/*key", get(object::download_object))
        .route(
            "/upload",
            post(object::simple_upload).put(object::simple_upload),
        )
        .route("/download", get(object::simple_download));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .with_state(state.clone())
        // Innermost first. A client body that stalls fails the upload.
        .layer(RequestBodyTimeoutLayer::new(server.read_timeout))
        // Caps the time a response body may go without progress.
        .layer(ResponseBodyTimeoutLayer::new(server.write_timeout))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        // Objects are streamed; no body size cap.
        .layer(DefaultBodyLimit::disable());

    if metrics_enabled {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    }
}

// -- Request ID middleware ----------------------------------------------------

/// Tag every response with `x-request-id`.
///
/// An ID supplied by the client is reused, otherwise one is generated.
/// Handlers run inside the ID's scope so error bodies quote the same value.
async fn request_id_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = with_request_id(request_id.clone(), next.run(req)).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// -- Built-in endpoints -------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        for expected in [
            "/health",
            "/s3/buckets",
            "/s3/buckets/{bucket}",
            "/s3/buckets/{bucket}/{key}",
            "/upload",
            "/download",
        ] {
            assert!(paths.iter().any(|p| p == expected), "missing {expected}");
        }
    }
}
