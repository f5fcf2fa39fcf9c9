//! In-memory object store.
//!
//! Buckets and objects are held in `tokio::sync::RwLock<BTreeMap<...>>`
//! maps, so listings come back in key order like S3's.  Used for offline
//! development (`STORAGE_BACKEND=memory`) and as the stub backend in tests.
//! Nothing is persisted.

use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tokio::sync::RwLock;

use super::backend::{
    format_timestamp, BucketList, BucketSummary, ByteStream, ListObjectsParams, ObjectDownload,
    ObjectList, ObjectStore, ObjectSummary, StoreError, StoreFuture, UploadOutput,
};
use aws_sdk_s3::primitives::DateTime;

/// Default page size of a listing, matching S3.
const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    content_type: String,
    etag: String,
    last_modified: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryBucket {
    created: Option<String>,
    objects: BTreeMap<String, MemoryObject>,
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, MemoryBucket>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given buckets already present.
    pub async fn with_buckets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for name in names {
            store.create_bucket(&name.into()).await;
        }
        store
    }

    /// Create `bucket` if it does not exist yet.
    pub async fn create_bucket(&self, bucket: &str) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_insert_with(|| MemoryBucket {
                created: now(),
                objects: BTreeMap::new(),
            });
    }

    /// Compute the quoted MD5 ETag of the given data.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }
}

fn now() -> Option<String> {
    format_timestamp(&DateTime::from(SystemTime::now()))
}

impl ObjectStore for MemoryStore {
    fn list_buckets(&self) -> StoreFuture<'_, BucketList> {
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            Ok(BucketList {
                buckets: buckets
                    .iter()
                    .map(|(name, bucket)| BucketSummary {
                        name: name.clone(),
                        creation_date: bucket.created.clone(),
                    })
                    .collect(),
                owner: None,
            })
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        params: &'a ListObjectsParams,
    ) -> StoreFuture<'a, ObjectList> {
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;

            let prefix = params.prefix.as_deref().unwrap_or("");
            let max_keys = params
                .max_keys
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(DEFAULT_MAX_KEYS);

            // The continuation token is the last key of the previous page.
            let mut matching = entry
                .objects
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .filter(|(key, _)| match params.continuation_token.as_deref() {
                    Some(after) => key.as_str() > after,
                    None => true,
                })
                .peekable();

            let mut contents = Vec::new();
            while contents.len() < max_keys {
                let Some((key, object)) = matching.next() else {
                    break;
                };
                contents.push(ObjectSummary {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    etag: Some(object.etag.clone()),
                    last_modified: object.last_modified.clone(),
                    storage_class: Some("STANDARD".to_string()),
                });
            }

            let is_truncated = matching.peek().is_some();
            let next_continuation_token = if is_truncated {
                contents.last().map(|o| o.key.clone())
            } else {
                None
            };

            Ok(ObjectList {
                name: bucket.to_string(),
                prefix: params.prefix.clone().filter(|p| !p.is_empty()),
                key_count: contents.len(),
                is_truncated,
                next_continuation_token,
                contents,
            })
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        content_type: &'a str,
        mut body: ByteStream<'a>,
    ) -> StoreFuture<'a, UploadOutput> {
        Box::pin(async move {
            if !self.buckets.read().await.contains_key(bucket) {
                return Err(StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                });
            }

            let mut buf = BytesMut::new();
            while let Some(chunk) = body.next().await {
                buf.extend_from_slice(&chunk.map_err(StoreError::Body)?);
            }
            let data = buf.freeze();
            let etag = Self::compute_etag(&data);
            let size = data.len() as u64;

            let mut buckets = self.buckets.write().await;
            let entry = buckets
                .get_mut(bucket)
                .ok_or_else(|| StoreError::NoSuchBucket {
                    bucket: bucket.to_string(),
                })?;
            entry.objects.insert(
                key.to_string(),
                MemoryObject {
                    data,
                    content_type: content_type.to_string(),
                    etag: etag.clone(),
                    last_modified: now(),
                },
            );

            Ok(UploadOutput {
                location: format!("memory://{bucket}/{key}"),
                bucket: bucket.to_string(),
                key: key.to_string(),
                etag: Some(etag),
                version_id: None,
                upload_id: None,
                size,
            })
        })
    }

    fn get_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ObjectDownload> {
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;
            let object = entry
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })?;

            let MemoryObject {
                data,
                content_type,
                etag,
                ..
            } = object;

            Ok(ObjectDownload {
                content_type: Some(content_type),
                content_length: Some(data.len() as u64),
                etag: Some(etag),
                body: Box::pin(stream::once(async move { Ok(data) })),
            })
        })
    }
}
