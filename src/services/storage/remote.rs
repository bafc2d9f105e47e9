//! Backend over the `object_store` crate: S3/MinIO buckets in production and
//! an in-memory store for tests.
//!
//! Object stores have no directories and no cheap existence check for a
//! prefix, so existence is answered from object metadata or a one-key listing,
//! and grouping under `/` is delegated to the store's delimiter listing.

use super::{
    BatchDeleteReport, ByteStream, KeyError, ListPage, ListRequest, ObjectBackend, ObjectInfo,
    StorageError, StorageResult, paginate,
};
use crate::{config::S3Settings, models::object_key::ObjectKey};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{ObjectMeta, ObjectStore, PutPayload, memory::InMemory, path::Path};
use std::{collections::HashSet, io, sync::Arc};
use tracing::{debug, info};

#[derive(Clone)]
pub struct RemoteBackend {
    store: Arc<dyn ObjectStore>,
    kind: &'static str,
}

impl RemoteBackend {
    pub fn new(store: Arc<dyn ObjectStore>, kind: &'static str) -> Self {
        Self { store, kind }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory")
    }

    /// Build an S3 client; `endpoint` switches to path-style requests for MinIO.
    pub fn s3(settings: &S3Settings) -> StorageResult<Self> {
        use object_store::aws::AmazonS3Builder;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region);

        if let Some(key_id) = &settings.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"))
                .with_virtual_hosted_style_request(false);
        }

        let store = builder.build()?;
        info!(bucket = %settings.bucket, region = %settings.region, "configured S3 backend");
        Ok(Self::new(Arc::new(store), "s3"))
    }
}

fn location(key: &str) -> StorageResult<Path> {
    Path::parse(key).map_err(|_| StorageError::InvalidKey(key.to_string()))
}

/// Store path for a listing prefix. The store matches whole segments, so only
/// the part up to the last `/` is handed over; callers filter the rest.
fn prefix_location(prefix: &str) -> StorageResult<Option<Path>> {
    let dir = match prefix.rfind('/') {
        Some(pos) => &prefix[..pos],
        None => "",
    };
    if dir.is_empty() {
        Ok(None)
    } else {
        location(dir).map(Some)
    }
}

fn map_error(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::ObjectStore(other),
    }
}

fn object_info(meta: ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        key: meta.location.to_string(),
        size: meta.size as u64,
        last_modified: meta.last_modified,
    }
}

#[async_trait]
impl ObjectBackend for RemoteBackend {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn put(&self, key: &ObjectKey, data: Bytes) -> StorageResult<ObjectKey> {
        let path = location(key.as_str())?;
        let size = data.len();
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|err| map_error(key.as_str(), err))?;
        debug!(key = %key, bytes = size, backend = self.kind, "stored object");
        Ok(key.clone())
    }

    async fn open(&self, key: &ObjectKey) -> StorageResult<ByteStream> {
        let path = location(key.as_str())?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|err| map_error(key.as_str(), err))?;
        Ok(result.into_stream().map_err(io::Error::other).boxed())
    }

    async fn stat(&self, key: &ObjectKey) -> StorageResult<Option<ObjectInfo>> {
        let path = location(key.as_str())?;
        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(object_info(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(StorageError::ObjectStore(err)),
        }
    }

    /// `head` is tried first: it is a single metadata request and never reads
    /// the body. Only a miss pays for the one-entry listing that detects a
    /// directory prefix.
    async fn exists(&self, key: &ObjectKey) -> StorageResult<bool> {
        let path = location(key.as_str())?;
        match self.store.head(&path).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(err) => return Err(StorageError::ObjectStore(err)),
        }
        // No object under the exact key; it may still name a directory prefix.
        match self.store.list(Some(&path)).next().await {
            Some(Ok(_)) => Ok(true),
            Some(Err(err)) => Err(StorageError::ObjectStore(err)),
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        let path = location(key.as_str())?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(StorageError::ObjectStore(err)),
        }
    }

    async fn delete_chunk(&self, keys: &[ObjectKey]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport::default();
        let mut locations = Vec::with_capacity(keys.len());
        for key in keys {
            match location(key.as_str()) {
                Ok(path) => locations.push(path),
                Err(err) => report.errors.push(KeyError {
                    key: key.to_string(),
                    error: err.to_string(),
                }),
            }
        }
        let submitted: Vec<String> = locations.iter().map(|p| p.to_string()).collect();

        let input = futures::stream::iter(locations.into_iter().map(Ok)).boxed();
        let results: Vec<object_store::Result<Path>> =
            self.store.delete_stream(input).collect().await;

        let mut confirmed = HashSet::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(path) => {
                    confirmed.insert(path.to_string());
                }
                Err(object_store::Error::NotFound { path, .. }) => {
                    confirmed.insert(path);
                }
                Err(err) => failures.push(err.to_string()),
            }
        }

        // Batch responses do not always name the failing key; pair unconfirmed
        // keys with the reported errors in order.
        let mut failures = failures.into_iter();
        for key in submitted {
            if confirmed.contains(&key) {
                report.deleted += 1;
            } else {
                let error = failures
                    .next()
                    .unwrap_or_else(|| "not confirmed by batch delete".to_string());
                report.errors.push(KeyError { key, error });
            }
        }
        report
    }

    async fn list_page(&self, request: &ListRequest) -> StorageResult<ListPage> {
        let prefix = prefix_location(&request.prefix)?;

        if request.delimited {
            // The store already walks every page of a delimiter listing.
            let result = self.store.list_with_delimiter(prefix.as_ref()).await?;
            let objects = result
                .objects
                .into_iter()
                .map(object_info)
                .filter(|o| o.key.starts_with(&request.prefix))
                .filter(|o| match &request.start_after {
                    Some(after) => o.key.as_str() > after.as_str(),
                    None => true,
                })
                .collect();
            let common_prefixes = result
                .common_prefixes
                .into_iter()
                .map(|p| format!("{}/", p))
                .filter(|p| p.starts_with(&request.prefix))
                .collect();
            return Ok(ListPage {
                objects,
                common_prefixes,
                next_start_after: None,
            });
        }

        let stream = match &request.start_after {
            Some(after) => {
                let offset = location(after)?;
                self.store.list_with_offset(prefix.as_ref(), &offset)
            }
            None => self.store.list(prefix.as_ref()),
        };
        let rows: Vec<ObjectInfo> = stream
            .map_ok(object_info)
            .try_filter(|o| futures::future::ready(o.key.starts_with(&request.prefix)))
            .take(request.max_keys + 1)
            .try_collect()
            .await?;
        Ok(paginate(rows, request))
    }

    async fn copy(&self, from: &ObjectKey, to: &ObjectKey) -> StorageResult<()> {
        let source = location(from.as_str())?;
        let target = location(to.as_str())?;
        self.store
            .copy(&source, &target)
            .await
            .map_err(|err| map_error(from.as_str(), err))
    }
}
