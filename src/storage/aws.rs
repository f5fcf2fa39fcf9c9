//! S3-compatible storage backend.
//!
//! Forwards every operation to an S3 endpoint through the AWS SDK.  The
//! endpoint is configurable so the proxy can sit in front of an emulator
//! (LocalStack, MinIO) during local development.
//!
//! Uploads are streamed: bodies that fit into one part go out as a single
//! `PutObject`, larger bodies as a multipart upload that is aborted if any
//! step fails.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit keys
//! are configured.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream;
use std::io;
use tracing::{debug, info, warn};

use super::backend::{
    format_timestamp, BucketList, BucketSummary, ByteStream, ListObjectsParams, ObjectDownload,
    ObjectList, ObjectStore, ObjectSummary, Owner, StoreError, StoreFuture, UploadOutput,
};
use super::parts::PartReader;
use crate::config::{StorageConfig, MIN_PART_SIZE};

/// Backend that forwards operations to an S3-compatible service.
pub struct S3Store {
    /// AWS S3 SDK client.
    client: Client,
    /// Endpoint used to build object locations.
    endpoint_url: String,
    /// Whether locations use path-style addressing.
    force_path_style: bool,
    /// Upload part size in bytes.
    part_size: usize,
}

impl S3Store {
    /// Create a new S3 backend from the storage configuration.
    pub async fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint_url);

        // If explicit credentials are provided, inject them as static credentials.
        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "bucketproxy-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(
            "S3 backend initialized: endpoint={} region={} path_style={}",
            config.endpoint_url, config.region, config.force_path_style
        );

        Ok(Self::from_client(
            Client::from_conf(s3_config),
            config.endpoint_url.clone(),
            config.force_path_style,
            config.upload_part_size,
        ))
    }

    /// Wrap an already-built SDK client.
    pub fn from_client(
        client: Client,
        endpoint_url: String,
        force_path_style: bool,
        part_size: usize,
    ) -> Self {
        Self {
            client,
            endpoint_url,
            force_path_style,
            part_size: effective_part_size(part_size),
        }
    }

    /// URL under which `bucket`/`key` is reachable on the backend.
    fn object_location(&self, bucket: &str, key: &str) -> String {
        object_location(&self.endpoint_url, self.force_path_style, bucket, key)
    }

    /// Single-request upload for bodies that fit into one part.
    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<UploadOutput, StoreError> {
        let size = data.len() as u64;
        debug!("S3 put_object: bucket={} key={} size={}", bucket, key, size);

        let resp = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", bucket, None, e))?;

        Ok(UploadOutput {
            location: self.object_location(bucket, key),
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: resp.e_tag().map(str::to_string),
            version_id: resp.version_id().map(str::to_string),
            upload_id: None,
            size,
        })
    }

    /// Multipart upload; `first` is the already-read first part.
    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        first: Bytes,
        reader: &mut PartReader<'_>,
    ) -> Result<UploadOutput, StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", bucket, None, e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| {
                StoreError::backend(
                    "create_multipart_upload",
                    anyhow::anyhow!("backend did not return an upload id"),
                )
            })?
            .to_string();

        debug!(
            "S3 multipart upload started: bucket={} key={} upload_id={}",
            bucket, key, upload_id
        );

        match self
            .upload_parts(bucket, key, &upload_id, first, reader)
            .await
        {
            Ok(output) => Ok(output),
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "S3 abort_multipart_upload failed: bucket={} key={} upload_id={}: {}",
                        bucket,
                        key,
                        upload_id,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Bytes,
        reader: &mut PartReader<'_>,
    ) -> Result<UploadOutput, StoreError> {
        let mut completed = Vec::new();
        let mut next = Some(first);
        let mut part_number: i32 = 1;

        while let Some(data) = next {
            debug!(
                "S3 upload_part: bucket={} key={} upload_id={} part={} size={}",
                bucket,
                key,
                upload_id,
                part_number,
                data.len()
            );

            let resp = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(SdkByteStream::from(data))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", bucket, None, e))?;

            completed.push(
                CompletedPart::builder()
                    .set_e_tag(resp.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            next = reader.next_part().await.map_err(StoreError::Body)?;
        }

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("complete_multipart_upload", bucket, None, e))?;

        Ok(UploadOutput {
            location: resp
                .location()
                .map(str::to_string)
                .unwrap_or_else(|| self.object_location(bucket, key)),
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: resp.e_tag().map(str::to_string),
            version_id: resp.version_id().map(str::to_string),
            upload_id: Some(upload_id.to_string()),
            size: reader.total(),
        })
    }
}

impl ObjectStore for S3Store {
    fn list_buckets(&self) -> StoreFuture<'_, BucketList> {
        Box::pin(async move {
            debug!("S3 list_buckets");

            let resp = self
                .client
                .list_buckets()
                .send()
                .await
                .map_err(|e| map_sdk_error("list_buckets", "", None, e))?;

            let buckets = resp
                .buckets()
                .iter()
                .map(|b| BucketSummary {
                    name: b.name().unwrap_or_default().to_string(),
                    creation_date: b.creation_date().and_then(format_timestamp),
                })
                .collect();

            let owner = resp.owner().map(|o| Owner {
                id: o.id().map(str::to_string),
                display_name: o.display_name().map(str::to_string),
            });

            Ok(BucketList { buckets, owner })
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        params: &'a ListObjectsParams,
    ) -> StoreFuture<'a, ObjectList> {
        Box::pin(async move {
            debug!("S3 list_objects_v2: bucket={} params={:?}", bucket, params);

            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(params.prefix.clone())
                .set_max_keys(params.max_keys)
                .set_continuation_token(params.continuation_token.clone())
                .send()
                .await
                .map_err(|e| map_sdk_error("list_objects", bucket, None, e))?;

            let contents: Vec<ObjectSummary> = resp
                .contents()
                .iter()
                .map(|o| ObjectSummary {
                    key: o.key().unwrap_or_default().to_string(),
                    size: o.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    etag: o.e_tag().map(str::to_string),
                    last_modified: o.last_modified().and_then(format_timestamp),
                    storage_class: o.storage_class().map(|c| c.as_str().to_string()),
                })
                .collect();

            Ok(ObjectList {
                name: resp.name().unwrap_or(bucket).to_string(),
                prefix: resp.prefix().filter(|p| !p.is_empty()).map(str::to_string),
                key_count: contents.len(),
                is_truncated: resp.is_truncated().unwrap_or(false),
                next_continuation_token: resp.next_continuation_token().map(str::to_string),
                contents,
            })
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        content_type: &'a str,
        body: ByteStream<'a>,
    ) -> StoreFuture<'a, UploadOutput> {
        Box::pin(async move {
            let mut reader = PartReader::new(body, self.part_size);
            let first = reader
                .next_part()
                .await
                .map_err(StoreError::Body)?
                .unwrap_or_default();

            if reader.is_exhausted() {
                self.put_single(bucket, key, content_type, first).await
            } else {
                self.put_multipart(bucket, key, content_type, first, &mut reader)
                    .await
            }
        })
    }

    fn get_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ObjectDownload> {
        Box::pin(async move {
            debug!("S3 get_object: bucket={} key={}", bucket, key);

            let resp = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error("get_object", bucket, Some(key), e))?;

            let content_type = resp.content_type().map(str::to_string);
            let content_length = resp.content_length().and_then(|l| u64::try_from(l).ok());
            let etag = resp.e_tag().map(str::to_string);

            // Hand the SDK body over chunk by chunk as it arrives.
            let body = stream::unfold(resp.body, |mut body| async move {
                match body.try_next().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), body)),
                    Ok(None) => None,
                    Err(e) => Some((Err(io::Error::other(e)), body)),
                }
            });

            Ok(ObjectDownload {
                content_type,
                content_length,
                etag,
                body: Box::pin(body),
            })
        })
    }
}

/// S3 rejects non-final parts below 5 MiB.
fn effective_part_size(configured: usize) -> usize {
    configured.max(MIN_PART_SIZE)
}

/// Build the URL of an object on `endpoint`.
fn object_location(endpoint: &str, path_style: bool, bucket: &str, key: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if path_style {
        return format!("{endpoint}/{bucket}/{key}");
    }
    match endpoint.split_once("://") {
        Some((scheme, host)) => format!("{scheme}://{bucket}.{host}/{key}"),
        None => format!("{bucket}.{endpoint}/{key}"),
    }
}

/// Map an SDK error onto the store taxonomy using the S3 error code.
fn map_sdk_error<E, R>(
    operation: &'static str,
    bucket: &str,
    key: Option<&str>,
    err: SdkError<E, R>,
) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    classify(bucket, key, err.code()).unwrap_or_else(|| {
        StoreError::backend(
            operation,
            anyhow::anyhow!("{}", DisplayErrorContext(&err)),
        )
    })
}

/// Translate well-known "not found" error codes.
fn classify(
    bucket: &str,
    key: Option<&str>,
    code: Option<&str>,
) -> Option<StoreError> {
    match (code, key) {
        (Some("NoSuchBucket"), _) => Some(StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        }),
        (Some("NoSuchKey") | Some("NotFound"), Some(key)) => Some(StoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::config::{
        BehaviorVersion, Credentials, Region, StalledStreamProtectionConfig,
    };
    use aws_smithy_http_client::test_util::{ReplayEvent, StaticReplayClient};
    use aws_smithy_types::body::SdkBody;

    #[test]
    fn test_path_style_location() {
        assert_eq!(
            object_location("http://localhost:4566", true, "demo", "hello.txt"),
            "http://localhost:4566/demo/hello.txt"
        );
        assert_eq!(
            object_location("http://localhost:4566/", true, "demo", "a/b.txt"),
            "http://localhost:4566/demo/a/b.txt"
        );
    }

    #[test]
    fn test_virtual_host_location() {
        assert_eq!(
            object_location("https://s3.us-west-2.amazonaws.com", false, "demo", "k"),
            "https://demo.s3.us-west-2.amazonaws.com/k"
        );
    }

    #[test]
    fn test_classify_missing_bucket() {
        let err = classify("demo", None, Some("NoSuchBucket")).unwrap();
        assert!(matches!(err, StoreError::NoSuchBucket { bucket } if bucket == "demo"));
    }

    #[test]
    fn test_classify_missing_key() {
        let err = classify("demo", Some("k"), Some("NoSuchKey")).unwrap();
        assert!(matches!(err, StoreError::NoSuchKey { key, .. } if key == "k"));
    }

    #[test]
    fn test_classify_other_codes_fall_through() {
        assert!(classify("demo", Some("k"), Some("AccessDenied")).is_none());
        assert!(classify("", None, None).is_none());
        // NotFound only means a missing key when a key was involved.
        assert!(classify("demo", None, Some("NotFound")).is_none());
    }

    #[test]
    fn test_part_size_is_clamped_to_s3_minimum() {
        assert_eq!(effective_part_size(1024), MIN_PART_SIZE);
        assert_eq!(effective_part_size(64 * 1024 * 1024), 64 * 1024 * 1024);
    }

    // -- Uploads against a replayed S3 endpoint --------------------------------

    const ENDPOINT: &str = "http://localhost:4566";

    fn replay_store(events: Vec<ReplayEvent>) -> (S3Store, StaticReplayClient) {
        let http_client = StaticReplayClient::new(events);
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("AKID", "SECRET", None, None, "test"))
            .endpoint_url(ENDPOINT)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .http_client(http_client.clone())
            .build();
        let store = S3Store::from_client(
            Client::from_conf(config),
            ENDPOINT.to_string(),
            true,
            MIN_PART_SIZE,
        );
        (store, http_client)
    }

    /// Replayed exchange; the expected request is never compared.
    fn event(status: u16, headers: &[(&str, &str)], body: &'static str) -> ReplayEvent {
        let mut response = http::Response::builder().status(status);
        for (name, value) in headers {
            response = response.header(*name, *value);
        }
        ReplayEvent::new(
            http::Request::builder()
                .uri(ENDPOINT)
                .body(SdkBody::empty())
                .unwrap(),
            response.body(SdkBody::from(body)).unwrap(),
        )
    }

    fn create_multipart_ok() -> ReplayEvent {
        event(
            200,
            &[],
            r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Bucket>demo</Bucket><Key>big.bin</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>"#,
        )
    }

    fn upload_part_ok(etag: &str) -> ReplayEvent {
        event(200, &[("etag", etag)], "")
    }

    /// `len` bytes delivered in 1 MiB chunks.
    fn body_of(len: usize) -> ByteStream<'static> {
        let chunks: Vec<io::Result<Bytes>> = (0..len)
            .step_by(1024 * 1024)
            .map(|start| Ok(Bytes::from(vec![7u8; (len - start).min(1024 * 1024)])))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    /// (method, uri) of every request the client sent.
    fn sent(http_client: &StaticReplayClient) -> Vec<(String, String)> {
        http_client
            .actual_requests()
            .map(|r| (r.method().to_string(), r.uri().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_small_body_is_a_single_put() {
        let (store, http_client) = replay_store(vec![event(200, &[("etag", "\"small\"")], "")]);

        let output = store
            .put_object("demo", "notes.txt", "text/plain", body_of(11))
            .await
            .unwrap();
        assert_eq!(output.size, 11);
        assert_eq!(output.etag.as_deref(), Some("\"small\""));
        assert!(output.upload_id.is_none());
        assert_eq!(output.location, "http://localhost:4566/demo/notes.txt");

        let requests: Vec<_> = http_client.actual_requests().collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method(), "PUT");
        assert!(requests[0].uri().contains("/demo/notes.txt"));
        assert!(!requests[0].uri().contains("uploadId"));
        assert_eq!(requests[0].headers().get("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_large_body_is_a_multipart_upload() {
        let (store, http_client) = replay_store(vec![
            create_multipart_ok(),
            upload_part_ok("\"p1\""),
            upload_part_ok("\"p2\""),
            upload_part_ok("\"p3\""),
            event(
                200,
                &[],
                r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Location>http://localhost:4566/demo/big.bin</Location><Bucket>demo</Bucket><Key>big.bin</Key><ETag>"final-3"</ETag></CompleteMultipartUploadResult>"#,
            ),
        ]);

        // Two full parts and a 1 MiB tail.
        let len = 2 * MIN_PART_SIZE + 1024 * 1024;
        let output = store
            .put_object("demo", "big.bin", "application/octet-stream", body_of(len))
            .await
            .unwrap();
        assert_eq!(output.size, len as u64);
        assert_eq!(output.upload_id.as_deref(), Some("upload-1"));
        assert_eq!(output.etag.as_deref(), Some("\"final-3\""));

        let requests = sent(&http_client);
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0].0, "POST");
        assert!(requests[0].1.contains("uploads"));
        for (i, (method, uri)) in requests[1..4].iter().enumerate() {
            assert_eq!(method, "PUT");
            assert!(uri.contains(&format!("partNumber={}", i + 1)), "{uri}");
            assert!(uri.contains("uploadId=upload-1"), "{uri}");
        }
        assert_eq!(requests[4].0, "POST");
        assert!(requests[4].1.contains("uploadId=upload-1"));

        // The completion lists every part with its ETag, in order.
        let complete = http_client.actual_requests().nth(4).unwrap();
        let xml = std::str::from_utf8(complete.body().bytes().unwrap()).unwrap();
        let first = xml.find("<PartNumber>1</PartNumber>").unwrap();
        let third = xml.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(first < third);
        assert!(xml.contains("p2"));
    }

    #[tokio::test]
    async fn test_failed_part_aborts_the_upload() {
        let (store, http_client) = replay_store(vec![
            create_multipart_ok(),
            upload_part_ok("\"p1\""),
            event(
                500,
                &[],
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"#,
            ),
            event(204, &[], ""),
        ]);

        let len = 2 * MIN_PART_SIZE + 1024 * 1024;
        let err = store
            .put_object("demo", "big.bin", "application/octet-stream", body_of(len))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::Backend { operation: "upload_part", .. }),
            "unexpected error: {err}"
        );

        let requests = sent(&http_client);
        assert_eq!(requests.len(), 4);
        let (method, uri) = &requests[3];
        assert_eq!(method, "DELETE");
        assert!(uri.contains("uploadId=upload-1"), "{uri}");
        assert!(uri.contains("/demo/big.bin"), "{uri}");
    }
}
