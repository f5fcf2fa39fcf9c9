//! Bucket-level handlers: list buckets, list objects.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use tracing::{debug, warn};

use crate::errors::ProxyError;
use crate::handlers::{json_response, parse_query, query_param};
use crate::metrics::record_backend_call;
use crate::storage::backend::ListObjectsParams;
use crate::AppState;

/// `GET /s3/buckets` -- list every bucket on the backend.
#[utoipa::path(
    get,
    path = "/s3/buckets",
    tag = "Buckets",
    operation_id = "ListBuckets",
    responses(
        (status = 200, description = "Bucket listing as JSON"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn list_buckets(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let result = state.store.list_buckets().await;
    record_backend_call("list_buckets", result.is_ok());

    let list = result.inspect_err(|e| {
        warn!(operation = "list_buckets", error = %e, "error listing buckets");
    })?;

    debug!("Listed {} buckets", list.buckets.len());
    json_response(&list)
}

/// `GET /s3/buckets/:bucket` -- list the objects of a bucket.
///
/// Optional query parameters `prefix`, `max-keys` and `continuation-token`
/// are forwarded to the backend.
#[utoipa::path(
    get,
    path = "/s3/buckets/{bucket}",
    tag = "Buckets",
    operation_id = "ListObjects",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("prefix" = Option<String>, Query, description = "Only keys starting with this prefix"),
        ("max-keys" = Option<i32>, Query, description = "Page size"),
        ("continuation-token" = Option<String>, Query, description = "Token from a previous truncated page")
    ),
    responses(
        (status = 200, description = "Object listing as JSON"),
        (status = 400, description = "Invalid query parameter"),
        (status = 404, description = "Bucket does not exist"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ProxyError> {
    let query = parse_query(raw_query.as_deref());
    let params = list_params(&query)?;

    let result = state.store.list_objects(&bucket, &params).await;
    record_backend_call("list_objects", result.is_ok());

    let list = result.inspect_err(|e| {
        warn!(operation = "list_objects", bucket = %bucket, error = %e, "error listing bucket");
    })?;

    debug!("Listed {} objects in {}", list.key_count, bucket);
    json_response(&list)
}

fn list_params(
    query: &std::collections::HashMap<String, String>,
) -> Result<ListObjectsParams, ProxyError> {
    let max_keys = match query_param(query, "max-keys") {
        Some(raw) => Some(
            raw.parse::<i32>()
                .ok()
                .filter(|n| *n >= 0)
                .ok_or_else(|| ProxyError::InvalidParameter {
                    name: "max-keys",
                    message: format!("'{raw}' is not a non-negative integer"),
                })?,
        ),
        None => None,
    };

    Ok(ListObjectsParams {
        prefix: query_param(query, "prefix").map(str::to_string),
        max_keys,
        continuation_token: query_param(query, "continuation-token").map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_defaults() {
        let params = list_params(&parse_query(None)).unwrap();
        assert_eq!(params, ListObjectsParams::default());
    }

    #[test]
    fn test_list_params_forwarded() {
        let query = parse_query(Some("prefix=logs%2F&max-keys=10&continuation-token=abc"));
        let params = list_params(&query).unwrap();
        assert_eq!(params.prefix.as_deref(), Some("logs/"));
        assert_eq!(params.max_keys, Some(10));
        assert_eq!(params.continuation_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_list_params_rejects_bad_max_keys() {
        assert!(list_params(&parse_query(Some("max-keys=lots"))).is_err());
        assert!(list_params(&parse_query(Some("max-keys=-1"))).is_err());
    }
}
