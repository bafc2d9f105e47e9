//! Local-disk backend: keys map one-to-one onto files beneath `root`.
//!
//! Writes go through a temp file that is fsynced and renamed into place, and
//! deletes prune directories left empty, so an on-disk folder exists exactly
//! while some object lives below it.

use super::{
    BatchDeleteReport, ByteStream, KeyError, ListPage, ListRequest, ObjectBackend, ObjectInfo,
    StorageError, StorageResult, paginate,
};
use crate::models::object_key::{ObjectKey, TEMP_PREFIX};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }

    /// Every file below `base`, as listing rows. A missing `base` is empty.
    async fn walk(&self, base: &Path) -> io::Result<Vec<ObjectInfo>> {
        let mut rows = Vec::new();
        let mut pending = vec![base.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) if err.kind() == ErrorKind::NotADirectory => continue,
                Err(err) => return Err(err),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    // Removed between read_dir and stat.
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                };
                if meta.is_dir() {
                    pending.push(path);
                } else if meta.is_file() {
                    if let Some(key) = self.key_for(&path) {
                        rows.push(ObjectInfo {
                            key,
                            size: meta.len(),
                            last_modified: meta
                                .modified()
                                .map(DateTime::<Utc>::from)
                                .unwrap_or_else(|_| Utc::now()),
                        });
                    }
                }
            }
        }

        Ok(rows)
    }

    /// Recursively remove empty directories up to the backend root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &ObjectKey, data: Bytes) -> StorageResult<ObjectKey> {
        let file_path = self.object_path(key.as_str());
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(key = %key, bytes = data.len(), "stored object on disk");
        Ok(key.clone())
    }

    async fn open(&self, key: &ObjectKey) -> StorageResult<ByteStream> {
        let path = self.object_path(key.as_str());
        let not_found = || StorageError::NotFound(key.to_string());

        let meta = fs::metadata(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_found()
            } else {
                StorageError::Io(err)
            }
        })?;
        if !meta.is_file() {
            return Err(not_found());
        }

        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_found()
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn stat(&self, key: &ObjectKey) -> StorageResult<Option<ObjectInfo>> {
        match fs::metadata(self.object_path(key.as_str())).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
                last_modified: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> StorageResult<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    async fn delete(&self, key: &ObjectKey) -> StorageResult<()> {
        let file_path = self.object_path(key.as_str());
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn delete_chunk(&self, keys: &[ObjectKey]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport::default();
        for key in keys {
            match self.delete(key).await {
                Ok(()) => report.deleted += 1,
                Err(err) => report.errors.push(KeyError {
                    key: key.to_string(),
                    error: err.to_string(),
                }),
            }
        }
        report
    }

    async fn list_page(&self, request: &ListRequest) -> StorageResult<ListPage> {
        let base_dir = match request.prefix.rfind('/') {
            Some(pos) => self.object_path(&request.prefix[..pos]),
            None => self.root.clone(),
        };
        let mut rows = self.walk(&base_dir).await?;
        rows.retain(|row| row.key.starts_with(&request.prefix));
        Ok(paginate(rows, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::collect_stream;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    fn key(raw: &str) -> ObjectKey {
        ObjectKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn put_then_open_round_trips_without_tmp_leftovers() {
        let (dir, backend) = setup();
        backend
            .put(&key("t1/docs/a.txt"), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let data = collect_stream(backend.open(&key("t1/docs/a.txt")).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");

        for entry in std::fs::read_dir(dir.path().join("t1/docs")).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().starts_with(TEMP_PREFIX));
        }
    }

    #[tokio::test]
    async fn open_missing_or_directory_is_not_found() {
        let (_dir, backend) = setup();
        backend
            .put(&key("t1/docs/a.txt"), Bytes::new())
            .await
            .unwrap();
        assert!(matches!(
            backend.open(&key("t1/missing")).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.open(&key("t1/docs")).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_empty_dirs() {
        let (dir, backend) = setup();
        let k = key("t1/a/b/c.txt");
        backend.put(&k, Bytes::from_static(b"x")).await.unwrap();

        backend.delete(&k).await.unwrap();
        backend.delete(&k).await.unwrap();

        assert!(!dir.path().join("t1").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn delimited_listing_groups_subdirectories() {
        let (_dir, backend) = setup();
        for k in ["t1/a.txt", "t1/sub/b.txt", "t1/sub/deeper/c.txt", "t2/x.txt"] {
            backend.put(&key(k), Bytes::from_static(b"1")).await.unwrap();
        }

        let page = backend
            .list_page(&ListRequest::new("t1/").delimited(true))
            .await
            .unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["t1/a.txt"]);
        assert_eq!(page.common_prefixes, ["t1/sub/"]);

        let all = backend.list_page(&ListRequest::new("t1/")).await.unwrap();
        assert_eq!(all.objects.len(), 3);
        assert!(all.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn listing_a_missing_prefix_is_empty() {
        let (_dir, backend) = setup();
        let page = backend
            .list_page(&ListRequest::new("nobody/"))
            .await
            .unwrap();
        assert!(page.objects.is_empty());
        assert!(page.next_start_after.is_none());
    }
}
