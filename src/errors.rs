//! Proxy error types.
//!
//! Every variant maps to an HTTP status and a short machine-readable code.
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(ProxyError::MissingFile)`.
//!
//! Status policy: malformed client input is 400, a bucket or key the
//! backend does not know is 404, any other backend failure is 502, and
//! failures inside the proxy itself are 500.

use std::future::Future;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::HeaderValue;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::storage::backend::StoreError;

/// Response header carrying the request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Run `fut` with `id` as the request ID seen by error responses.
pub async fn with_request_id<F: Future>(id: String, fut: F) -> F::Output {
    REQUEST_ID.scope(id, fut).await
}

/// The ID of the request being served, or a fresh one outside a request.
pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(Clone::clone)
        .unwrap_or_else(|_| generate_request_id())
}

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The multipart form could not be decoded.
    #[error("malformed multipart form: {message}")]
    MalformedMultipart { message: String },

    /// The multipart form carries no `file` field.
    #[error("multipart form field 'file' is required")]
    MissingFile,

    /// The `file` field carries no usable file name and no key was given.
    #[error("multipart field 'file' has no file name; pass ?key= to name the object")]
    MissingFileName,

    /// A required query parameter is missing or empty.
    #[error("query parameter '{name}' is required")]
    MissingParameter { name: &'static str },

    /// A query parameter has an unusable value.
    #[error("query parameter '{name}' is invalid: {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// The upload body could not be read from the client.
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] std::io::Error),

    /// The bucket does not exist on the backend.
    #[error("bucket '{bucket}' does not exist")]
    NoSuchBucket { bucket: String },

    /// The key does not exist in the bucket.
    #[error("object '{key}' does not exist in bucket '{bucket}'")]
    NoSuchKey { bucket: String, key: String },

    /// The backend call failed.
    #[error("storage backend error: {0}")]
    Backend(#[source] StoreError),

    /// A backend response could not be encoded.
    #[error("failed to encode response: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoSuchBucket { bucket } => ProxyError::NoSuchBucket { bucket },
            StoreError::NoSuchKey { bucket, key } => ProxyError::NoSuchKey { bucket, key },
            StoreError::Body(source) => ProxyError::BodyRead(source),
            other @ StoreError::Backend { .. } => ProxyError::Backend(other),
        }
    }
}

impl ProxyError {
    /// Short error code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::MalformedMultipart { .. } => "MalformedMultipart",
            ProxyError::MissingFile => "MissingFile",
            ProxyError::MissingFileName => "MissingFileName",
            ProxyError::MissingParameter { .. } => "MissingParameter",
            ProxyError::InvalidParameter { .. } => "InvalidParameter",
            ProxyError::BodyRead(_) => "IncompleteBody",
            ProxyError::NoSuchBucket { .. } => "NoSuchBucket",
            ProxyError::NoSuchKey { .. } => "NoSuchKey",
            ProxyError::Backend(_) => "BackendError",
            ProxyError::Serialization(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedMultipart { .. }
            | ProxyError::MissingFile
            | ProxyError::MissingFileName
            | ProxyError::MissingParameter { .. }
            | ProxyError::InvalidParameter { .. }
            | ProxyError::BodyRead(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoSuchBucket { .. } | ProxyError::NoSuchKey { .. } => {
                StatusCode::NOT_FOUND
            }
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    request_id: &'a str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            request_id: &request_id,
        };

        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_client_errors_are_400() {
        assert_eq!(ProxyError::MissingFile.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::MalformedMultipart {
                message: "boundary".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::MissingParameter { name: "key" }.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_store_errors_map_by_class() {
        let not_found: ProxyError = StoreError::NoSuchKey {
            bucket: "demo".to_string(),
            key: "k".to_string(),
        }
        .into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let body: ProxyError =
            StoreError::Body(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof")).into();
        assert_eq!(body.status_code(), StatusCode::BAD_REQUEST);

        let backend: ProxyError =
            StoreError::backend("put_object", anyhow::anyhow!("connection refused")).into();
        assert_eq!(backend.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(backend.code(), "BackendError");
        assert!(backend.to_string().contains("put_object failed"));
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ProxyError::NoSuchBucket {
            bucket: "demo".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "NoSuchBucket");
        assert_eq!(json["message"], "bucket 'demo' does not exist");
        assert_eq!(json["requestId"].as_str().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_error_response_uses_scoped_request_id() {
        let response = with_request_id("trace-42".to_string(), async {
            ProxyError::MissingFile.into_response()
        })
        .await;
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-42");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["requestId"], "trace-42");
    }
}
