//! Prometheus metrics for the proxy.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the HTTP request middleware and
//! serves the `/metrics` endpoint.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "bucketproxy_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "bucketproxy_http_request_duration_seconds";

/// Backend calls (counter). Labels: operation, status.
pub const BACKEND_CALLS_TOTAL: &str = "bucketproxy_backend_calls_total";

/// Bytes accepted from clients and stored (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "bucketproxy_bytes_uploaded_total";

/// Bytes streamed to clients (counter).
pub const BYTES_DOWNLOADED_TOTAL: &str = "bucketproxy_bytes_downloaded_total";

/// Downloads that failed after the response head was sent (counter).
pub const DOWNLOAD_STREAM_ERRORS_TOTAL: &str = "bucketproxy_download_stream_errors_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the global Prometheus recorder.
///
/// Idempotent: later calls return the handle installed by the first one.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BACKEND_CALLS_TOTAL, "Storage backend calls by operation");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Total bytes uploaded to the backend");
    describe_counter!(BYTES_DOWNLOADED_TOTAL, "Total bytes streamed to clients");
    describe_counter!(
        DOWNLOAD_STREAM_ERRORS_TOTAL,
        "Downloads aborted by a backend stream error"
    );
}

/// Count one backend call.
pub fn record_backend_call(operation: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(BACKEND_CALLS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records request count and latency.
///
/// `/metrics` itself is not counted.  Latency is measured to the response
/// head; streamed bodies are accounted for by the byte counters.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to its route template so bucket and key names do not
/// become label values.
///
/// - `/s3/buckets` -> `/s3/buckets`
/// - `/s3/buckets/photos` -> `/s3/buckets/{bucket}`
/// - `/s3/buckets/photos/2024/a.jpg` -> `/s3/buckets/{bucket}/{key}`
/// - anything unrouted -> `other`
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/openapi.json" => "/openapi.json",
        "/upload" => "/upload",
        "/download" => "/download",
        "/s3/buckets" | "/s3/buckets/" => "/s3/buckets",
        _ => match path.strip_prefix("/s3/buckets/") {
            Some(rest) => match rest.split_once('/') {
                None => "/s3/buckets/{bucket}",
                Some((_, "")) => "/s3/buckets/{bucket}",
                Some(_) => "/s3/buckets/{bucket}/{key}",
            },
            None => "other",
        },
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Prometheus exposition text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/upload"), "/upload");
        assert_eq!(normalize_path("/download"), "/download");
        assert_eq!(normalize_path("/s3/buckets"), "/s3/buckets");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/s3/buckets/photos"), "/s3/buckets/{bucket}");
        assert_eq!(normalize_path("/s3/buckets/photos/"), "/s3/buckets/{bucket}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(
            normalize_path("/s3/buckets/photos/a.jpg"),
            "/s3/buckets/{bucket}/{key}"
        );
        assert_eq!(
            normalize_path("/s3/buckets/photos/2024/06/a.jpg"),
            "/s3/buckets/{bucket}/{key}"
        );
    }

    #[test]
    fn test_normalize_path_unrouted() {
        assert_eq!(normalize_path("/favicon.ico"), "other");
        assert_eq!(normalize_path("/s3"), "other");
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().unwrap() as *const PrometheusHandle;
        let second = init_metrics().unwrap() as *const PrometheusHandle;
        assert_eq!(first, second);
    }
}
