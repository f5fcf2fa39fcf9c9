//! Abstract object store trait.
//!
//! Every backend must implement [`ObjectStore`].  The trait works in terms
//! of boxed byte streams in both directions so handlers can forward request
//! bodies and response bodies without holding whole objects in memory.

use std::future::Future;
use std::io;
use std::pin::Pin;

use aws_sdk_s3::primitives::{DateTime, DateTimeFormat};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;

/// A fallible stream of body chunks.
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

/// Boxed future returned by every [`ObjectStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Failures surfaced by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The bucket does not exist on the backend.
    #[error("bucket '{bucket}' does not exist")]
    NoSuchBucket { bucket: String },

    /// The key does not exist in the bucket.
    #[error("object '{key}' does not exist in bucket '{bucket}'")]
    NoSuchKey { bucket: String, key: String },

    /// Reading the caller-supplied upload body failed.
    #[error("failed to read upload body: {0}")]
    Body(#[source] io::Error),

    /// The backend call itself failed.
    #[error("{operation} failed: {source:#}")]
    Backend {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    /// Wrap an arbitrary backend failure with the operation it came from.
    pub fn backend(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend {
            operation,
            source: source.into(),
        }
    }
}

/// Owner block of a bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Owner {
    #[serde(rename = "ID")]
    pub id: Option<String>,
    pub display_name: Option<String>,
}

/// One bucket in a [`BucketList`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketSummary {
    pub name: String,
    pub creation_date: Option<String>,
}

/// Result of a list-buckets call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketList {
    pub buckets: Vec<BucketSummary>,
    pub owner: Option<Owner>,
}

/// One object in an [`ObjectList`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub storage_class: Option<String>,
}

/// Result of a list-objects call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectList {
    pub name: String,
    pub prefix: Option<String>,
    pub key_count: usize,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub contents: Vec<ObjectSummary>,
}

/// Optional list-objects parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub max_keys: Option<i32>,
    pub continuation_token: Option<String>,
}

/// Result of an upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadOutput {
    pub location: String,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
    #[serde(rename = "VersionID")]
    pub version_id: Option<String>,
    /// Set when the body went out as a multipart upload.
    #[serde(rename = "UploadID")]
    pub upload_id: Option<String>,
    pub size: u64,
}

/// An object being read back from the store.
pub struct ObjectDownload {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub body: ByteStream<'static>,
}

impl std::fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Async object storage contract.
///
/// Implementations are shared across all in-flight requests and must be
/// safe for concurrent use.
pub trait ObjectStore: Send + Sync + 'static {
    /// List every bucket visible to the configured credentials.
    fn list_buckets(&self) -> StoreFuture<'_, BucketList>;

    /// List the objects of `bucket`.
    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        params: &'a ListObjectsParams,
    ) -> StoreFuture<'a, ObjectList>;

    /// Stream `body` into `bucket`/`key`.
    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        content_type: &'a str,
        body: ByteStream<'a>,
    ) -> StoreFuture<'a, UploadOutput>;

    /// Open `bucket`/`key` for streaming.
    fn get_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ObjectDownload>;
}

/// Render a backend timestamp as RFC 3339 (`2024-01-31T12:00:00Z`).
pub fn format_timestamp(ts: &DateTime) -> Option<String> {
    ts.fmt(DateTimeFormat::DateTime).ok()
}
