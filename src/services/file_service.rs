//! The file manager core: every operation a client can perform, scoped to an
//! explicit [`TenantContext`].
//!
//! `FileService` ties the object store, the directory engine and the path
//! index together. The object store decides what exists; index writes that
//! fail after a successful store write are logged and left for the next
//! directory scan to repair. Moves are the exception: when the record cannot
//! follow its object, the move is undone and reported.

use super::{
    directory_service::{DirectoryService, relative, relocate_object},
    error::{FileError, FileResult},
    notifications::{FileEvent, Notifier, TenantEvents},
    path_index::PathIndex,
    storage::{ByteStream, ObjectStorage, StorageError},
    tenant::{TenantContext, normalize_relative, sanitize_name},
};
use crate::models::{
    directory::{DirectoryListing, DirectoryNode, FileEntry},
    file_record::{FileRecord, MetadataUpdate, Tag},
    object_key::{ObjectKey, file_type_of},
    reports::{DeleteReport, MoveReport, MovedFile, PathError, TreeMove, UploadedFile},
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt,
    io::{self, Cursor, Write},
};
use zip::{ZipWriter, result::ZipError, write::SimpleFileOptions};
use tracing::{debug, info, warn};

/// Largest text preview returned by [`FileService::preview_text`].
pub const PREVIEW_LIMIT: usize = 1024 * 1024;

const PREVIEW_TYPES: [&str; 8] = ["txt", "md", "csv", "json", "xml", "html", "css", "js"];

const INLINE_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/pdf",
    "text/plain",
];

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Type,
    Date,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Search, filter and sort options for [`FileService::browse`]. Only files
/// are filtered; folders are always listed.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct FileQuery {
    /// Case-insensitive substring of the file name.
    pub search: Option<String>,
    pub file_type: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub direction: SortDirection,
}

/// A streaming download.
pub struct Download {
    pub filename: String,
    pub content_type: &'static str,
    pub size: u64,
    /// Whether browsers may render the content instead of saving it.
    pub inline: bool,
    pub stream: ByteStream,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .field("inline", &self.inline)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct FileService {
    storage: ObjectStorage,
    index: PathIndex,
    directories: DirectoryService,
    notifier: Notifier,
}

impl FileService {
    pub fn new(
        storage: ObjectStorage,
        index: PathIndex,
        notifier: Notifier,
        sweep_probability: f64,
    ) -> Self {
        let directories = DirectoryService::new(storage.clone(), index.clone(), sweep_probability);
        Self {
            storage,
            index,
            directories,
            notifier,
        }
    }

    pub fn storage(&self) -> &ObjectStorage {
        &self.storage
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    // --- Folders ---

    pub async fn create_directory(
        &self,
        ctx: &TenantContext,
        parent: &str,
        name: &str,
    ) -> FileResult<String> {
        let path = self.directories.create(ctx, parent, name).await?;
        self.notifier.publish(ctx, FileEvent::FolderCreated { path: path.clone() });
        Ok(path)
    }

    pub async fn rename_directory(
        &self,
        ctx: &TenantContext,
        old_path: &str,
        new_name: &str,
    ) -> FileResult<TreeMove> {
        let result = self.directories.rename(ctx, old_path, new_name).await?;
        self.publish_folder_move(ctx, old_path, &result);
        Ok(result)
    }

    pub async fn move_directory(
        &self,
        ctx: &TenantContext,
        path: &str,
        target_dir: &str,
    ) -> FileResult<TreeMove> {
        let result = self.directories.move_into(ctx, path, target_dir).await?;
        self.publish_folder_move(ctx, path, &result);
        Ok(result)
    }

    pub async fn delete_directory(
        &self,
        ctx: &TenantContext,
        path: &str,
    ) -> FileResult<DeleteReport> {
        let report = self.directories.delete(ctx, path).await?;
        if report.deleted > 0 {
            self.notifier.publish(
                ctx,
                FileEvent::FolderDeleted {
                    path: normalize_relative(path).unwrap_or_default(),
                },
            );
        }
        Ok(report)
    }

    pub async fn list_directory(
        &self,
        ctx: &TenantContext,
        path: &str,
    ) -> FileResult<DirectoryListing> {
        self.directories.list(ctx, path).await
    }

    /// List a folder, then filter and sort its files.
    pub async fn browse(
        &self,
        ctx: &TenantContext,
        path: &str,
        query: &FileQuery,
    ) -> FileResult<DirectoryListing> {
        let mut listing = self.directories.list(ctx, path).await?;

        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let file_type = query
            .file_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_start_matches('.').to_ascii_lowercase());
        let tag = query.tag.as_deref().map(str::trim).filter(|s| !s.is_empty());

        listing.files.retain(|file| {
            search
                .as_ref()
                .is_none_or(|needle| file.name.to_lowercase().contains(needle.as_str()))
                && file_type.as_ref().is_none_or(|ty| file.file_type() == *ty)
                && tag.is_none_or(|tag| file.record.as_ref().is_some_and(|r| r.has_tag(tag)))
        });

        listing.files.sort_by(|a, b| {
            let ordering = compare_files(a, b, query.sort);
            match query.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        Ok(listing)
    }

    pub async fn build_tree(&self, ctx: &TenantContext) -> FileResult<DirectoryNode> {
        self.directories.build_tree(ctx).await
    }

    pub async fn ensure_root(&self, ctx: &TenantContext) -> FileResult<bool> {
        self.directories.ensure_root(ctx).await
    }

    // --- Files ---

    /// Move files into `target_dir`. Colliding names get a timestamp suffix;
    /// nothing is ever overwritten.
    pub async fn move_files(
        &self,
        ctx: &TenantContext,
        paths: &[String],
        target_dir: &str,
    ) -> FileResult<MoveReport> {
        let target = normalize_relative(target_dir)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", target_dir)))?;
        let target_prefix = ctx
            .dir_prefix(&target)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", target_dir)))?;
        if !target.is_empty() && !self.storage.prefix_occupied(&target_prefix).await? {
            return Err(FileError::not_found(format!("folder `{}`", target)));
        }

        let mut report = MoveReport::default();
        for path in paths {
            match self.move_one(ctx, path, &target_prefix).await {
                Ok(moved) => report.moved.push(moved),
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to move file");
                    report.errors.push(PathError::new(path.as_str(), err));
                }
            }
        }

        info!(
            tenant = %ctx.tenant_id,
            target = %target,
            summary = %report.summary(),
            "moved files"
        );
        if !report.moved.is_empty() {
            self.notifier.publish(
                ctx,
                FileEvent::FilesMoved {
                    paths: report.moved.iter().map(|m| m.new_path.clone()).collect(),
                    target,
                },
            );
        }
        Ok(report)
    }

    async fn move_one(
        &self,
        ctx: &TenantContext,
        path: &str,
        target_prefix: &str,
    ) -> FileResult<MovedFile> {
        let source = self.existing_file(ctx, path).await?;
        if source.parent_prefix() == target_prefix {
            return Err(FileError::invalid("file is already in the target folder"));
        }

        let destination = self.free_key(target_prefix, source.file_name()).await?;
        self.relocate(&source, &destination).await?;
        Ok(MovedFile {
            old_path: relative(ctx, source.as_str()),
            new_path: relative(ctx, destination.as_str()),
        })
    }

    /// Rename a file within its folder.
    pub async fn rename_file(
        &self,
        ctx: &TenantContext,
        path: &str,
        new_name: &str,
    ) -> FileResult<String> {
        let name = sanitize_name(new_name)?;
        let source = self.existing_file(ctx, path).await?;
        if source.file_name() == name {
            return Ok(relative(ctx, source.as_str()));
        }

        let destination = ObjectKey::parse(&format!("{}{}", source.parent_prefix(), name))?;
        if self.name_taken(&destination).await? {
            return Err(FileError::AlreadyExists(relative(ctx, destination.as_str())));
        }
        self.relocate(&source, &destination).await?;

        let old_path = relative(ctx, source.as_str());
        let new_path = relative(ctx, destination.as_str());
        info!(tenant = %ctx.tenant_id, from = %old_path, to = %new_path, "renamed file");
        self.notifier.publish(
            ctx,
            FileEvent::FileRenamed {
                old_path,
                new_path: new_path.clone(),
            },
        );
        Ok(new_path)
    }

    /// Store `data` as `name` inside `dir`. A colliding name gets a timestamp suffix.
    pub async fn upload_file(
        &self,
        ctx: &TenantContext,
        dir: &str,
        name: &str,
        data: Bytes,
    ) -> FileResult<UploadedFile> {
        let name = sanitize_name(name)?;
        let prefix = ctx
            .dir_prefix(dir)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", dir)))?;

        let key = self.free_key(&prefix, &name).await?;
        let size = data.len() as u64;
        let etag = format!("{:x}", md5::compute(&data));
        self.storage.put(&key, data).await?;

        if let Err(err) = self
            .index
            .observe(ctx.tenant_id.as_str(), &ctx.actor_id, &key, size)
            .await
        {
            warn!(key = %key, error = %err, "uploaded file not indexed");
        }

        let uploaded = UploadedFile {
            path: relative(ctx, key.as_str()),
            name: key.file_name().to_string(),
            size,
            file_type: file_type_of(key.file_name()),
            etag,
        };
        info!(tenant = %ctx.tenant_id, path = %uploaded.path, bytes = size, "uploaded file");
        self.notifier.publish(
            ctx,
            FileEvent::FileUploaded {
                path: uploaded.path.clone(),
            },
        );
        Ok(uploaded)
    }

    pub async fn download_file(&self, ctx: &TenantContext, path: &str) -> FileResult<Download> {
        let key = self.visible_key(ctx, path)?;
        let info = self
            .storage
            .stat(&key)
            .await?
            .ok_or_else(|| FileError::not_found(format!("file `{}`", path)))?;
        let stream = self.storage.open(&key).await?;

        let content_type = content_type_for(key.file_name());
        Ok(Download {
            filename: key.file_name().to_string(),
            content_type,
            size: info.size,
            inline: INLINE_TYPES.contains(&content_type),
            stream,
        })
    }

    /// Zip the requested files that exist, flat, by basename.
    pub async fn download_bundle(
        &self,
        ctx: &TenantContext,
        paths: &[String],
    ) -> FileResult<Bytes> {
        if paths.is_empty() {
            return Err(FileError::invalid("no files selected"));
        }

        let mut entries = Vec::new();
        let mut used: HashSet<String> = HashSet::new();
        for path in paths {
            let Ok(key) = self.visible_key(ctx, path) else {
                debug!(path = %path, "skipping invalid bundle path");
                continue;
            };
            let data = match self.storage.read(&key).await {
                Ok(data) => data,
                Err(StorageError::NotFound(_)) => {
                    debug!(path = %path, "skipping missing bundle file");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let entry_name = unique_entry_name(key.file_name(), &used);
            used.insert(entry_name.clone());
            entries.push((entry_name, data));
        }

        if entries.is_empty() {
            return Err(FileError::not_found("none of the selected files"));
        }

        let files = entries.len();
        let archive = tokio::task::spawn_blocking(move || write_zip(entries))
            .await
            .map_err(|err| ZipError::Io(io::Error::other(err)))??;
        debug!(tenant = %ctx.tenant_id, files, bytes = archive.len(), "built download bundle");
        Ok(archive)
    }

    /// Delete files. `deleted` counts the paths that existed.
    pub async fn delete_files(
        &self,
        ctx: &TenantContext,
        paths: &[String],
    ) -> FileResult<DeleteReport> {
        let mut existing = Vec::new();
        for path in paths {
            let Ok(key) = self.visible_key(ctx, path) else {
                continue;
            };
            if self.storage.stat(&key).await?.is_some() && !existing.contains(&key) {
                existing.push(key);
            }
        }
        if existing.is_empty() {
            return Ok(DeleteReport::default());
        }

        let batch = self.storage.batch_delete(&existing).await;
        let failed = batch.failed_keys();
        let gone: Vec<String> = existing
            .iter()
            .filter(|k| !failed.contains(k.as_str()))
            .map(|k| k.to_string())
            .collect();
        if let Err(err) = self.index.delete_many(&gone).await {
            warn!(error = %err, "index rows of deleted files not removed");
        }

        let report = DeleteReport {
            deleted: batch.deleted,
            errors: batch
                .errors
                .iter()
                .map(|e| PathError::new(relative(ctx, &e.key), &e.error))
                .collect(),
        };
        info!(
            tenant = %ctx.tenant_id,
            deleted = report.deleted,
            failed = report.errors.len(),
            "deleted files"
        );
        self.notifier.publish(
            ctx,
            FileEvent::FilesDeleted {
                paths: gone.iter().map(|k| relative(ctx, k)).collect(),
            },
        );
        Ok(report)
    }

    // --- Metadata ---

    pub async fn save_metadata(
        &self,
        ctx: &TenantContext,
        path: &str,
        update: &MetadataUpdate,
    ) -> FileResult<FileRecord> {
        let key = self.visible_key(ctx, path)?;
        let info = self
            .storage
            .stat(&key)
            .await?
            .ok_or_else(|| FileError::not_found(format!("file `{}`", path)))?;

        let record = self
            .index
            .save_metadata(ctx.tenant_id.as_str(), &ctx.actor_id, &key, info.size, update)
            .await?;
        self.notifier.publish(
            ctx,
            FileEvent::MetadataSaved {
                path: relative(ctx, key.as_str()),
            },
        );
        Ok(record)
    }

    /// Metadata of an existing file. A record whose object vanished is removed.
    pub async fn get_metadata(&self, ctx: &TenantContext, path: &str) -> FileResult<FileRecord> {
        let key = self.visible_key(ctx, path)?;
        let Some(info) = self.storage.stat(&key).await? else {
            if self.index.get(key.as_str()).await?.is_some() {
                let err = FileError::Consistency(format!("record for missing object `{}`", key));
                warn!(error = %err, "removing stale index record");
                self.index.delete(key.as_str()).await?;
            }
            return Err(FileError::not_found(format!("file `{}`", path)));
        };

        match self.index.get(key.as_str()).await? {
            Some(record) if record.file_size == info.size as i64 => Ok(record),
            _ => {
                self.index
                    .observe(ctx.tenant_id.as_str(), &ctx.actor_id, &key, info.size)
                    .await
            }
        }
    }

    pub async fn tags(&self, ctx: &TenantContext) -> FileResult<Vec<Tag>> {
        self.index.tags(ctx.tenant_id.as_str()).await
    }

    /// Leading text of a previewable file, at most [`PREVIEW_LIMIT`] bytes.
    /// `None` for types that have no text preview.
    pub async fn preview_text(
        &self,
        ctx: &TenantContext,
        path: &str,
    ) -> FileResult<Option<String>> {
        let key = self.visible_key(ctx, path)?;
        if !PREVIEW_TYPES.contains(&file_type_of(key.file_name()).as_str()) {
            return Ok(None);
        }

        let mut stream = self.storage.open(&key).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(StorageError::Io)?;
            buf.extend_from_slice(&chunk);
            if buf.len() >= PREVIEW_LIMIT {
                buf.truncate(PREVIEW_LIMIT);
                break;
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    pub fn subscribe(&self, ctx: &TenantContext) -> TenantEvents {
        self.notifier.subscribe(ctx)
    }

    // --- Helpers ---

    /// Key of a user-visible file; placeholders and paths outside the tenant
    /// are reported as not found.
    fn visible_key(&self, ctx: &TenantContext, path: &str) -> FileResult<ObjectKey> {
        match ctx.object_key(path) {
            Some(key) if !key.is_placeholder() => Ok(key),
            _ => Err(FileError::not_found(format!("file `{}`", path))),
        }
    }

    async fn existing_file(&self, ctx: &TenantContext, path: &str) -> FileResult<ObjectKey> {
        let key = self.visible_key(ctx, path)?;
        if self.storage.stat(&key).await?.is_none() {
            return Err(FileError::not_found(format!("file `{}`", path)));
        }
        Ok(key)
    }

    /// A file or folder already uses this key's name.
    async fn name_taken(&self, key: &ObjectKey) -> FileResult<bool> {
        if self.storage.stat(key).await?.is_some() {
            return Ok(true);
        }
        Ok(self
            .storage
            .prefix_occupied(&format!("{}/", key))
            .await?)
    }

    /// `name` inside `prefix`, or `{stem}_{YYYYmmddHHMMSS}{ext}` when taken.
    async fn free_key(&self, prefix: &str, name: &str) -> FileResult<ObjectKey> {
        let key = ObjectKey::parse(&format!("{}{}", prefix, name))?;
        if !self.name_taken(&key).await? {
            return Ok(key);
        }

        let (stem, ext) = split_extension(name);
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut attempt = 0usize;
        loop {
            let candidate = if attempt == 0 {
                format!("{}{}_{}{}", prefix, stem, stamp, ext)
            } else {
                format!("{}{}_{}_{}{}", prefix, stem, stamp, attempt, ext)
            };
            let key = ObjectKey::parse(&candidate)?;
            if !self.name_taken(&key).await? {
                debug!(name, renamed = %key.file_name(), "name collision, renamed");
                return Ok(key);
            }
            attempt += 1;
        }
    }

    async fn relocate(&self, from: &ObjectKey, to: &ObjectKey) -> FileResult<()> {
        relocate_object(&self.storage, &self.index, from, to).await
    }

    fn publish_folder_move(&self, ctx: &TenantContext, old_path: &str, result: &TreeMove) {
        self.notifier.publish(
            ctx,
            FileEvent::FolderMoved {
                old_path: normalize_relative(old_path).unwrap_or_default(),
                new_path: result.path.clone(),
            },
        );
    }
}

fn compare_files(a: &FileEntry, b: &FileEntry, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        SortKey::Size => a.size.cmp(&b.size),
        SortKey::Type => a.file_type().cmp(&b.file_type()),
        SortKey::Date => a.last_modified.cmp(&b.last_modified),
    }
    .then_with(|| a.name.cmp(&b.name))
}

/// `("report", ".csv")` for `report.csv`; dotfiles and bare names have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

/// `name`, or `stem (n).ext` with the smallest `n` not already in `used`.
fn unique_entry_name(name: &str, used: &HashSet<String>) -> String {
    if !used.contains(name) {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    (1..)
        .map(|n| format!("{} ({}){}", stem, n, ext))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

fn write_zip(entries: Vec<(String, Bytes)>) -> Result<Bytes, ZipError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(name, options)?;
        writer.write_all(&data)?;
    }
    Ok(Bytes::from(writer.finish()?.into_inner()))
}

/// Content type by extension, `application/octet-stream` when unknown.
pub fn content_type_for(name: &str) -> &'static str {
    match file_type_of(name).as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_split_at_last_dot() {
        assert_eq!(split_extension("q1.csv"), ("q1", ".csv"));
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".env"), (".env", ""));
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("notes.txt"), "text/plain");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn zip_archives_contain_every_entry() {
        let archive = write_zip(vec![
            ("a.txt".into(), Bytes::from_static(b"one")),
            ("a (1).txt".into(), Bytes::from_static(b"two")),
        ])
        .unwrap();
        let mut reader = zip::ZipArchive::new(Cursor::new(archive.to_vec())).unwrap();
        assert_eq!(reader.len(), 2);
        assert!(reader.by_name("a (1).txt").is_ok());
    }

    #[test]
    fn bundle_names_skip_suffixes_already_taken() {
        let mut used = HashSet::new();
        for name in ["a.txt", "a.txt", "a (1).txt", "a.txt"] {
            let entry = unique_entry_name(name, &used);
            used.insert(entry);
        }
        let mut names: Vec<&str> = used.iter().map(String::as_str).collect();
        names.sort();
        assert_eq!(names, vec!["a (1) (1).txt", "a (1).txt", "a (2).txt", "a.txt"]);
    }

    #[test]
    fn duplicate_zip_entries_are_not_transient() {
        let err = write_zip(vec![
            ("a.txt".into(), Bytes::from_static(b"one")),
            ("a.txt".into(), Bytes::from_static(b"two")),
        ])
        .unwrap_err();
        let err = FileError::from(err);
        assert!(matches!(err, FileError::Archive(_)));
        assert!(!err.is_transient());
    }
}
