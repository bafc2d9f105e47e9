//! Object Store Adapter.
//!
//! [`ObjectBackend`] is the single capability surface every backend provides
//! (local disk, S3-compatible buckets, in-memory). [`ObjectStorage`] wraps a
//! backend chosen at construction time and adds what every caller needs on
//! top: per-call timeouts, batch-delete chunking and page exhaustion.
//!
//! Listing prefixes are either empty or end in `/`.

pub mod local;
pub mod remote;

use crate::models::object_key::ObjectKey;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt, pin_mut, stream::BoxStream};
use serde::Serialize;
use std::{collections::BTreeSet, future::Future, io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Keys per batch-delete call accepted by S3-style APIs.
pub const BATCH_DELETE_LIMIT: usize = 1000;

/// Default page size for prefix listings.
pub const LIST_PAGE_SIZE: usize = 1000;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

impl StorageError {
    /// Transient failures may succeed when the caller retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Timeout { .. } | StorageError::Io(_) | StorageError::ObjectStore(_)
        )
    }
}

impl From<crate::models::object_key::InvalidKey> for StorageError {
    fn from(err: crate::models::object_key::InvalidKey) -> Self {
        StorageError::InvalidKey(err.0)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Listing entry for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    pub prefix: String,
    /// Group keys below the next `/` into common prefixes.
    pub delimited: bool,
    /// Continuation: only keys strictly greater than this are returned.
    pub start_after: Option<String>,
    pub max_keys: usize,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimited: false,
            start_after: None,
            max_keys: LIST_PAGE_SIZE,
        }
    }

    pub fn delimited(mut self, delimited: bool) -> Self {
        self.delimited = delimited;
        self
    }

    pub fn limit(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }

    pub fn after(mut self, key: impl Into<String>) -> Self {
        self.start_after = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    /// Set when more keys remain; pass back as `start_after`.
    pub next_start_after: Option<String>,
}

/// A fully exhausted prefix listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyError {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchDeleteReport {
    pub deleted: usize,
    pub errors: Vec<KeyError>,
}

impl BatchDeleteReport {
    pub fn merge(&mut self, other: BatchDeleteReport) {
        self.deleted += other.deleted;
        self.errors.extend(other.errors);
    }

    pub fn failed_keys(&self) -> BTreeSet<&str> {
        self.errors.iter().map(|e| e.key.as_str()).collect()
    }
}

/// Raw storage I/O for one backend.
///
/// Implementations must be safe to call concurrently for distinct keys.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short backend name used in logs and readiness output.
    fn kind(&self) -> &'static str;

    async fn put(&self, key: &ObjectKey, data: Bytes) -> StorageResult<ObjectKey>;

    /// Stream an object's content. `StorageError::NotFound` when absent.
    async fn open(&self, key: &ObjectKey) -> StorageResult<ByteStream>;

    async fn stat(&self, key: &ObjectKey) -> StorageResult<Option<ObjectInfo>>;

    /// Existence check that never reads the object body.
    async fn exists(&self, key: &ObjectKey) -> StorageResult<bool>;

    /// Delete one object. Deleting an absent key succeeds.
    async fn delete(&self, key: &ObjectKey) -> StorageResult<()>;

    /// Delete up to [`BATCH_DELETE_LIMIT`] keys in one backend call.
    async fn delete_chunk(&self, keys: &[ObjectKey]) -> BatchDeleteReport;

    /// One page of a prefix listing, in lexicographic key order.
    async fn list_page(&self, request: &ListRequest) -> StorageResult<ListPage>;

    async fn copy(&self, from: &ObjectKey, to: &ObjectKey) -> StorageResult<()> {
        let data = collect_stream(self.open(from).await?).await?;
        self.put(to, data).await.map(|_| ())
    }
}

/// Time budgets for backend calls.
#[derive(Debug, Clone, Copy)]
pub struct StorageTimeouts {
    /// Single-object calls: put, open, stat, delete, copy.
    pub object: Duration,
    /// One listing page.
    pub listing: Duration,
    /// One batch-delete chunk.
    pub batch: Duration,
}

impl Default for StorageTimeouts {
    fn default() -> Self {
        Self {
            object: Duration::from_secs(30),
            listing: Duration::from_secs(120),
            batch: Duration::from_secs(120),
        }
    }
}

/// The adapter used by the rest of the crate.
#[derive(Clone)]
pub struct ObjectStorage {
    backend: Arc<dyn ObjectBackend>,
    timeouts: StorageTimeouts,
}

impl ObjectStorage {
    pub fn new(backend: Arc<dyn ObjectBackend>, timeouts: StorageTimeouts) -> Self {
        Self { backend, timeouts }
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub async fn put(&self, key: &ObjectKey, data: Bytes) -> StorageResult<ObjectKey> {
        bounded("put", self.timeouts.object, self.backend.put(key, data)).await
    }

    pub async fn open(&self, key: &ObjectKey) -> StorageResult<ByteStream> {
        bounded("open", self.timeouts.object, self.backend.open(key)).await
    }

    /// Read a whole object into memory.
    pub async fn read(&self, key: &ObjectKey) -> StorageResult<Bytes> {
        bounded("read", self.timeouts.object, async {
            collect_stream(self.backend.open(key).await?).await
        })
        .await
    }

    pub async fn stat(&self, key: &ObjectKey) -> StorageResult<Option<ObjectInfo>> {
        bounded("stat", self.timeouts.object, self.backend.stat(key)).await
    }

    pub async fn exists(&self, key: &ObjectKey) -> StorageResult<bool> {
        bounded("exists", self.timeouts.object, self.backend.exists(key)).await
    }

    pub async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        bounded("delete", self.timeouts.object, self.backend.delete(key)).await
    }

    pub async fn copy(&self, from: &ObjectKey, to: &ObjectKey) -> StorageResult<()> {
        bounded("copy", self.timeouts.object, self.backend.copy(from, to)).await
    }

    /// Delete many keys, chunked to the backend batch limit.
    ///
    /// Chunks are submitted sequentially; a failed or timed-out chunk is
    /// reported per key and the remaining chunks still run.
    pub async fn batch_delete(&self, keys: &[ObjectKey]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport::default();
        for chunk in keys.chunks(BATCH_DELETE_LIMIT) {
            match tokio::time::timeout(self.timeouts.batch, self.backend.delete_chunk(chunk)).await
            {
                Ok(chunk_report) => report.merge(chunk_report),
                Err(_) => {
                    warn!(
                        keys = chunk.len(),
                        after = ?self.timeouts.batch,
                        "batch delete chunk timed out"
                    );
                    report.errors.extend(chunk.iter().map(|key| KeyError {
                        key: key.to_string(),
                        error: format!("batch delete timed out after {:?}", self.timeouts.batch),
                    }));
                }
            }
        }
        debug!(
            requested = keys.len(),
            deleted = report.deleted,
            failed = report.errors.len(),
            "batch delete finished"
        );
        report
    }

    pub async fn list_page(&self, request: &ListRequest) -> StorageResult<ListPage> {
        bounded("list", self.timeouts.listing, self.backend.list_page(request)).await
    }

    /// Lazy sequence of listing pages. Restart from any page by issuing a
    /// [`ListRequest`] with that page's `next_start_after`.
    pub fn pages<'a>(
        &'a self,
        prefix: &str,
        delimited: bool,
    ) -> impl Stream<Item = StorageResult<ListPage>> + Send + use<'a> {
        let first = ListRequest::new(prefix).delimited(delimited);
        futures::stream::try_unfold(Some(first), move |next| async move {
            let Some(request) = next else {
                return Ok::<_, StorageError>(None);
            };
            let page = self.list_page(&request).await?;
            let following = match &page.next_start_after {
                Some(token) if request.start_after.as_deref() != Some(token.as_str()) => {
                    Some(request.clone().after(token.clone()))
                }
                _ => None,
            };
            Ok(Some((page, following)))
        })
    }

    /// Exhaust every page under `prefix`.
    pub async fn list_by_prefix(&self, prefix: &str, delimited: bool) -> StorageResult<Listing> {
        let mut objects = Vec::new();
        let mut common_prefixes = BTreeSet::new();

        let pages = self.pages(prefix, delimited);
        pin_mut!(pages);
        while let Some(page) = pages.try_next().await? {
            objects.extend(page.objects);
            common_prefixes.extend(page.common_prefixes);
        }

        Ok(Listing {
            objects,
            common_prefixes: common_prefixes.into_iter().collect(),
        })
    }

    /// Whether at least one key lives under `prefix` (a one-key listing).
    pub async fn prefix_occupied(&self, prefix: &str) -> StorageResult<bool> {
        let page = self.list_page(&ListRequest::new(prefix).limit(1)).await?;
        Ok(!page.objects.is_empty() || !page.common_prefixes.is_empty())
    }
}

async fn bounded<T>(
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = StorageResult<T>>,
) -> StorageResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(op, after = ?limit, "storage call timed out");
            Err(StorageError::Timeout { op, after: limit })
        }
    }
}

pub(crate) async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Compute the common prefix a key groups under for a delimited listing.
///
/// Returns `Some(prefix)` when the key lies below `requested_prefix` and has a
/// further `/` after it, otherwise `None` (the key is a direct match).
pub(crate) fn compute_common_prefix(key: &str, requested_prefix: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(requested_prefix)?;
    after_prefix
        .find('/')
        .map(|pos| format!("{}{}", requested_prefix, &after_prefix[..=pos]))
}

/// Split sorted rows into a page: keep `max_keys`, report the continuation.
pub(crate) fn paginate(mut rows: Vec<ObjectInfo>, request: &ListRequest) -> ListPage {
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    if let Some(after) = &request.start_after {
        rows.retain(|row| row.key.as_str() > after.as_str());
    }

    let mut next_start_after = None;
    if rows.len() > request.max_keys {
        rows.truncate(request.max_keys);
        next_start_after = rows.last().map(|row| row.key.clone());
    }

    let mut objects = Vec::new();
    let mut common_prefixes = BTreeSet::new();
    for row in rows {
        if request.delimited {
            if let Some(prefix) = compute_common_prefix(&row.key, &request.prefix) {
                common_prefixes.insert(prefix);
                continue;
            }
        }
        objects.push(row);
    }

    ListPage {
        objects,
        common_prefixes: common_prefixes.into_iter().collect(),
        next_start_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(raw: &str) -> ObjectKey {
        ObjectKey::parse(raw).unwrap()
    }

    fn memory_storage() -> ObjectStorage {
        ObjectStorage::new(Arc::new(RemoteBackend::in_memory()), StorageTimeouts::default())
    }

    #[test]
    fn common_prefix_groups_deeper_keys() {
        assert_eq!(
            compute_common_prefix("t1/a/b/c.txt", "t1/"),
            Some("t1/a/".to_string())
        );
        assert_eq!(compute_common_prefix("t1/c.txt", "t1/"), None);
        assert_eq!(compute_common_prefix("t2/c.txt", "t1/"), None);
    }

    #[test]
    fn paginate_reports_last_kept_key_as_continuation() {
        let rows = ["p/c", "p/a", "p/b"]
            .iter()
            .map(|k| ObjectInfo {
                key: k.to_string(),
                size: 0,
                last_modified: Utc::now(),
            })
            .collect();
        let page = paginate(rows, &ListRequest::new("p/").limit(2));
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p/a", "p/b"]);
        assert_eq!(page.next_start_after.as_deref(), Some("p/b"));
    }

    #[tokio::test]
    async fn list_by_prefix_exhausts_all_pages() {
        let storage = memory_storage();
        for i in 0..2_500 {
            storage
                .put(&key(&format!("t1/bulk/f{i:04}")), Bytes::new())
                .await
                .unwrap();
        }
        let listing = storage.list_by_prefix("t1/bulk/", false).await.unwrap();
        assert_eq!(listing.objects.len(), 2_500);

        let pages: Vec<_> = storage
            .pages("t1/bulk/", false)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
    }

    #[tokio::test]
    async fn batch_delete_chunks_and_counts() {
        let storage = memory_storage();
        let keys: Vec<_> = (0..2_100).map(|i| key(&format!("t1/x/{i}"))).collect();
        for k in &keys {
            storage.put(k, Bytes::from_static(b"x")).await.unwrap();
        }
        let report = storage.batch_delete(&keys).await;
        assert_eq!(report.deleted, 2_100);
        assert!(report.errors.is_empty());
        assert!(!storage.prefix_occupied("t1/x/").await.unwrap());
    }

    struct StallingBackend {
        chunk_calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectBackend for StallingBackend {
        fn kind(&self) -> &'static str {
            "stalling"
        }
        async fn put(&self, key: &ObjectKey, _data: Bytes) -> StorageResult<ObjectKey> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(key.clone())
        }
        async fn open(&self, key: &ObjectKey) -> StorageResult<ByteStream> {
            Err(StorageError::NotFound(key.to_string()))
        }
        async fn stat(&self, _key: &ObjectKey) -> StorageResult<Option<ObjectInfo>> {
            Ok(None)
        }
        async fn exists(&self, _key: &ObjectKey) -> StorageResult<bool> {
            Ok(false)
        }
        async fn delete(&self, _key: &ObjectKey) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_chunk(&self, keys: &[ObjectKey]) -> BatchDeleteReport {
            let call = self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            BatchDeleteReport {
                deleted: keys.len(),
                errors: Vec::new(),
            }
        }
        async fn list_page(&self, _request: &ListRequest) -> StorageResult<ListPage> {
            Ok(ListPage::default())
        }
    }

    #[tokio::test]
    async fn timeouts_are_transient_and_do_not_stop_later_chunks() {
        let timeouts = StorageTimeouts {
            object: Duration::from_millis(20),
            listing: Duration::from_millis(20),
            batch: Duration::from_millis(20),
        };
        let storage = ObjectStorage::new(
            Arc::new(StallingBackend {
                chunk_calls: AtomicUsize::new(0),
            }),
            timeouts,
        );

        let err = storage.put(&key("t1/a"), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout { op: "put", .. }));
        assert!(err.is_transient());

        let keys: Vec<_> = (0..1_500).map(|i| key(&format!("t1/k{i}"))).collect();
        let report = storage.batch_delete(&keys).await;
        assert_eq!(report.errors.len(), BATCH_DELETE_LIMIT);
        assert_eq!(report.deleted, 500);
    }
}
