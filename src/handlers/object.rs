//! Object-level handlers: upload and streaming download.
//!
//! Uploads accept either a `multipart/form-data` body with a `file` field or
//! a raw body.  Either way the bytes are streamed into the backend without
//! buffering the whole object.  Downloads stream the backend body straight
//! into the response and log how many bytes were written.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, RawQuery, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ProxyError;
use crate::handlers::{json_response, parse_query, query_param};
use crate::metrics::{
    record_backend_call, BYTES_DOWNLOADED_TOTAL, BYTES_UPLOADED_TOTAL,
    DOWNLOAD_STREAM_ERRORS_TOTAL,
};
use crate::storage::backend::{ByteStream, ObjectDownload, UploadOutput};
use crate::AppState;

/// Name of the multipart field carrying the file.
const FILE_FIELD: &str = "file";

/// Fallback content type.
const OCTET_STREAM: &str = "application/octet-stream";

// -- Upload -------------------------------------------------------------------

/// `PUT|POST /s3/buckets/:bucket` -- upload an object.
///
/// The key is taken from `?key=`, else from the multipart file name, else a
/// fresh UUID for raw bodies.  Responds with the upload result as JSON.
#[utoipa::path(
    put,
    path = "/s3/buckets/{bucket}",
    tag = "Objects",
    operation_id = "UploadObject",
    params(
        ("bucket" = String, Path, description = "Target bucket"),
        ("key" = Option<String>, Query, description = "Object key; overrides the file name")
    ),
    responses(
        (status = 200, description = "Upload result as JSON"),
        (status = 400, description = "Malformed form or missing file field"),
        (status = 404, description = "Bucket does not exist"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn upload_object(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    request: Request,
) -> Result<Response, ProxyError> {
    let query = parse_query(raw_query.as_deref());
    let key = query_param(&query, "key").map(str::to_string);

    let output = receive_upload(&state, &bucket, key, request).await?;
    json_response(&output)
}

/// `PUT|POST /upload?key=` -- upload a raw body into the default bucket.
///
/// Responds with the stored key as plain text.
#[utoipa::path(
    put,
    path = "/upload",
    tag = "Objects",
    operation_id = "SimpleUpload",
    params(("key" = String, Query, description = "Object key")),
    responses(
        (status = 200, description = "The stored key", body = String),
        (status = 400, description = "Missing key"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn simple_upload(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
    request: Request,
) -> Result<Response, ProxyError> {
    let query = parse_query(raw_query.as_deref());
    let key = query_param(&query, "key")
        .ok_or(ProxyError::MissingParameter { name: "key" })?
        .to_string();
    let bucket = state.config.storage.default_bucket.clone();

    let output = receive_upload(&state, &bucket, Some(key), request).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output.key,
    )
        .into_response())
}

async fn receive_upload(
    state: &AppState,
    bucket: &str,
    explicit_key: Option<String>,
    request: Request,
) -> Result<UploadOutput, ProxyError> {
    if !is_multipart(request.headers()) {
        let key = explicit_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let content_type = header_content_type(request.headers())
            .unwrap_or_else(|| guess_content_type(&key));
        let body: ByteStream<'_> = Box::pin(
            request
                .into_body()
                .into_data_stream()
                .map_err(io::Error::other),
        );
        return store_upload(state, bucket, &key, &content_type, body).await;
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ProxyError::MalformedMultipart {
            message: e.body_text(),
        })?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ProxyError::MalformedMultipart {
                message: e.body_text(),
            })?
            .ok_or(ProxyError::MissingFile)?;

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let key = match explicit_key {
            Some(key) => key,
            None => field
                .file_name()
                .and_then(base_file_name)
                .ok_or(ProxyError::MissingFileName)?,
        };
        let content_type = field
            .content_type()
            .filter(|ct| !ct.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| guess_content_type(&key));

        let body: ByteStream<'_> = Box::pin(
            field.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.body_text())),
        );
        return store_upload(state, bucket, &key, &content_type, body).await;
    }
}

async fn store_upload(
    state: &AppState,
    bucket: &str,
    key: &str,
    content_type: &str,
    body: ByteStream<'_>,
) -> Result<UploadOutput, ProxyError> {
    debug!("Uploading {}/{} ({})", bucket, key, content_type);

    let result = state.store.put_object(bucket, key, content_type, body).await;
    record_backend_call("put_object", result.is_ok());

    let output = result.inspect_err(|e| {
        warn!(operation = "put_object", bucket = %bucket, key = %key, error = %e, "upload failed");
    })?;

    metrics::counter!(BYTES_UPLOADED_TOTAL).increment(output.size);
    info!("Uploaded {}/{} ({} bytes)", bucket, key, output.size);
    Ok(output)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

fn header_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .map(str::to_string)
}

fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// Strip any client-side directory from a submitted file name.
fn base_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    match base {
        "" | "." | ".." => None,
        _ => Some(base.to_string()),
    }
}

// -- Download -----------------------------------------------------------------

/// `GET /s3/buckets/:bucket/*key` -- stream an object to the client.
#[utoipa::path(
    get,
    path = "/s3/buckets/{bucket}/{key}",
    tag = "Objects",
    operation_id = "DownloadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key, may contain '/'")
    ),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 404, description = "Bucket or key does not exist"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn download_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ProxyError> {
    fetch_download(&state, bucket, key).await
}

/// `GET /download?key=` -- stream an object from the default bucket.
#[utoipa::path(
    get,
    path = "/download",
    tag = "Objects",
    operation_id = "SimpleDownload",
    params(("key" = String, Query, description = "Object key")),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 400, description = "Missing key"),
        (status = 404, description = "Key does not exist"),
        (status = 502, description = "Backend failure")
    )
)]
pub async fn simple_download(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ProxyError> {
    let query = parse_query(raw_query.as_deref());
    let key = query_param(&query, "key")
        .ok_or(ProxyError::MissingParameter { name: "key" })?
        .to_string();
    let bucket = state.config.storage.default_bucket.clone();
    fetch_download(&state, bucket, key).await
}

async fn fetch_download(
    state: &AppState,
    bucket: String,
    key: String,
) -> Result<Response, ProxyError> {
    let result = state.store.get_object(&bucket, &key).await;
    record_backend_call("get_object", result.is_ok());

    let download = result.inspect_err(|e| {
        warn!(operation = "get_object", bucket = %bucket, key = %key, error = %e, "download failed");
    })?;

    debug!("Streaming {}/{}", bucket, key);
    Ok(stream_response(bucket, key, download))
}

fn stream_response(bucket: String, key: String, download: ObjectDownload) -> Response {
    let ObjectDownload {
        content_type,
        content_length,
        etag,
        body,
    } = download;

    let disposition = content_disposition(&key);
    let mut response = Response::new(Body::from_stream(DownloadStream::new(bucket, key, body)));
    let headers = response.headers_mut();

    let content_type = content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static(OCTET_STREAM));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(len) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(value) = etag.and_then(|e| HeaderValue::from_str(&e).ok()) {
        headers.insert(header::ETAG, value);
    }

    response
}

/// Build an `attachment` disposition naming the last path segment of `key`.
///
/// Names outside printable ASCII also get an RFC 5987 `filename*`.
fn content_disposition(key: &str) -> String {
    let name = key.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or(key);

    let ascii: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    if ascii == name {
        format!("attachment; filename=\"{ascii}\"")
    } else {
        let encoded = utf8_percent_encode(name, NON_ALPHANUMERIC);
        format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
    }
}

/// Response body that forwards the backend stream and accounts for it.
///
/// Logs the byte count once the stream completes, logs and counts a
/// backend error that cuts the transfer short, and notes a client that
/// went away before the end.
struct DownloadStream {
    inner: ByteStream<'static>,
    bucket: String,
    key: String,
    written: u64,
    finished: bool,
}

impl DownloadStream {
    fn new(bucket: String, key: String, inner: ByteStream<'static>) -> Self {
        Self {
            inner,
            bucket,
            key,
            written: 0,
            finished: false,
        }
    }
}

impl Stream for DownloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.written += chunk.len() as u64;
                metrics::counter!(BYTES_DOWNLOADED_TOTAL).increment(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                metrics::counter!(DOWNLOAD_STREAM_ERRORS_TOTAL).increment(1);
                error!(
                    operation = "get_object",
                    bucket = %self.bucket,
                    key = %self.key,
                    written = self.written,
                    error = %e,
                    "download stream failed"
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                info!(
                    "Download of {}/{} complete. Wrote {} bytes",
                    self.bucket, self.key, self.written
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Download of {}/{} abandoned after {} bytes",
                self.bucket, self.key, self.written
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    #[test]
    fn test_base_file_name() {
        assert_eq!(base_file_name("hello.txt").as_deref(), Some("hello.txt"));
        assert_eq!(base_file_name("dir/sub/a.png").as_deref(), Some("a.png"));
        assert_eq!(base_file_name("C:\\Users\\me\\b.pdf").as_deref(), Some("b.pdf"));
        assert_eq!(base_file_name(""), None);
        assert_eq!(base_file_name("dir/"), None);
        assert_eq!(base_file_name(".."), None);
    }

    #[test]
    fn test_is_multipart() {
        let mut headers = HeaderMap::new();
        assert!(!is_multipart(&headers));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Multipart/Form-Data; boundary=x"),
        );
        assert!(is_multipart(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(!is_multipart(&headers));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a/b/photo.png"), "image/png");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
        assert_eq!(guess_content_type("blob"), OCTET_STREAM);
    }

    #[test]
    fn test_content_disposition_plain() {
        assert_eq!(
            content_disposition("reports/2024/q1.pdf"),
            "attachment; filename=\"q1.pdf\""
        );
    }

    #[test]
    fn test_content_disposition_flat_key_and_trailing_slash() {
        assert_eq!(
            content_disposition("hello.txt"),
            "attachment; filename=\"hello.txt\""
        );
        assert_eq!(
            content_disposition("exports/"),
            "attachment; filename=\"exports/\""
        );
    }

    #[test]
    fn test_content_disposition_escapes_quotes_and_unicode() {
        assert_eq!(
            content_disposition("say \"hi\".txt"),
            "attachment; filename=\"say _hi_.txt\"; filename*=UTF-8''say%20%22hi%22%2Etxt"
        );
        let value = content_disposition("résumé.pdf");
        assert!(value.starts_with("attachment; filename=\"r_sum_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[tokio::test]
    async fn test_download_stream_forwards_and_stops_after_error() {
        let inner: ByteStream<'static> = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ]));
        let mut stream = DownloadStream::new("demo".into(), "k".into(), inner);

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.written, 3);
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let download = ObjectDownload {
            content_type: Some("text/plain".to_string()),
            content_length: Some(5),
            etag: Some("\"abc\"".to_string()),
            body: Box::pin(stream::once(async { Ok(Bytes::from_static(b"hello")) })),
        };
        let response = stream_response("demo".into(), "dir/hello.txt".into(), download);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], "5");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(headers[header::ETAG], "\"abc\"");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"hello.txt\""
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }
}
