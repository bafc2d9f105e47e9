//! Virtual Directory Engine.
//!
//! The object store has no folders. A folder exists while at least one key
//! lives under its prefix; empty folders are kept alive by zero-byte
//! placeholder objects (`.keep_<hex>`), which never appear in listings.
//! Rename and move are copy-then-delete per key, so they are not atomic: a
//! failure part way leaves both trees partially populated and is reported
//! per path.

use super::{
    error::{FileError, FileResult},
    path_index::PathIndex,
    storage::{Listing, ObjectInfo, ObjectStorage},
    tenant::{TenantContext, join_relative, normalize_relative, sanitize_name},
};
use crate::models::{
    directory::{DirectoryEntry, DirectoryListing, DirectoryNode, FileEntry},
    object_key::{ObjectKey, file_name_of, is_placeholder_key},
    reports::{DeleteReport, PathError, TreeMove},
};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DirectoryService {
    storage: ObjectStorage,
    index: PathIndex,
    sweep_probability: f64,
}

impl DirectoryService {
    pub fn new(storage: ObjectStorage, index: PathIndex, sweep_probability: f64) -> Self {
        Self {
            storage,
            index,
            sweep_probability: sweep_probability.clamp(0.0, 1.0),
        }
    }

    /// Create `name` inside `parent` by minting a fresh placeholder.
    ///
    /// Two concurrent creators can both succeed; the duplicate placeholder is
    /// cleaned up later by the sweep.
    pub async fn create(
        &self,
        ctx: &TenantContext,
        parent: &str,
        name: &str,
    ) -> FileResult<String> {
        let name = sanitize_name(name)?;
        let parent_rel = normalize_relative(parent)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", parent)))?;
        let relative = join_relative(&parent_rel, &name);
        let prefix = self.prefix_for(ctx, &relative)?;

        if self.storage.prefix_occupied(&prefix).await? {
            return Err(FileError::AlreadyExists(format!("folder `{}`", relative)));
        }
        if let Some(file_key) = ctx.object_key(&relative) {
            if self.storage.stat(&file_key).await?.is_some() {
                return Err(FileError::AlreadyExists(format!("file `{}`", relative)));
            }
        }

        let marker = ObjectKey::placeholder_in(&prefix)?;
        self.storage.put(&marker, Bytes::new()).await?;

        info!(tenant = %ctx.tenant_id, path = %relative, "created folder");
        Ok(relative)
    }

    /// Rename a folder in place.
    pub async fn rename(
        &self,
        ctx: &TenantContext,
        old_path: &str,
        new_name: &str,
    ) -> FileResult<TreeMove> {
        let name = sanitize_name(new_name)?;
        let old_rel = non_root(old_path)?;
        let new_rel = join_relative(parent_of(&old_rel), &name);
        self.move_tree(ctx, &old_rel, &new_rel).await
    }

    /// Move a folder, keeping its name, below `target_dir`.
    pub async fn move_into(
        &self,
        ctx: &TenantContext,
        path: &str,
        target_dir: &str,
    ) -> FileResult<TreeMove> {
        let source = non_root(path)?;
        let target = normalize_relative(target_dir)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", target_dir)))?;

        if target == source || target.starts_with(&format!("{}/", source)) {
            return Err(FileError::invalid("cannot move a folder into itself"));
        }
        if !target.is_empty() && !self.exists(ctx, &target).await? {
            return Err(FileError::not_found(format!("folder `{}`", target)));
        }

        let new_rel = join_relative(&target, file_name_of(&source));
        self.move_tree(ctx, &source, &new_rel).await
    }

    async fn move_tree(
        &self,
        ctx: &TenantContext,
        old_rel: &str,
        new_rel: &str,
    ) -> FileResult<TreeMove> {
        let old_prefix = self.prefix_for(ctx, old_rel)?;
        let new_prefix = self.prefix_for(ctx, new_rel)?;

        // Enumerate before touching anything, so keys written mid-move are not chased.
        let listing = self.storage.list_by_prefix(&old_prefix, false).await?;
        if listing.objects.is_empty() {
            return Err(FileError::not_found(format!("folder `{}`", old_rel)));
        }
        if self.storage.prefix_occupied(&new_prefix).await? {
            return Err(FileError::AlreadyExists(format!("folder `{}`", new_rel)));
        }
        if let Some(file_key) = ctx.object_key(new_rel) {
            if self.storage.stat(&file_key).await?.is_some() {
                return Err(FileError::AlreadyExists(format!("file `{}`", new_rel)));
            }
        }

        let mut moved = 0;
        let mut errors = Vec::new();
        for object in &listing.objects {
            let shown = relative(ctx, &object.key);
            let outcome = async {
                let from = ObjectKey::parse(&object.key)?;
                let suffix = &object.key[old_prefix.len()..];
                let to = ObjectKey::parse(&format!("{}{}", new_prefix, suffix))?;
                relocate_object(&self.storage, &self.index, &from, &to).await
            }
            .await;

            match outcome {
                Ok(()) => moved += 1,
                Err(err) => {
                    warn!(path = %shown, error = %err, "failed to move object");
                    errors.push(PathError::new(shown, err));
                }
            }
        }

        if errors.is_empty() {
            let purged = self.index.delete_prefix(&old_prefix).await?;
            if purged > 0 {
                debug!(purged, prefix = %old_prefix, "purged stale index rows");
            }
        }

        info!(
            tenant = %ctx.tenant_id,
            from = %old_rel,
            to = %new_rel,
            moved,
            failed = errors.len(),
            "moved folder"
        );
        Ok(TreeMove {
            path: new_rel.to_string(),
            moved,
            errors,
        })
    }

    /// Recursively delete a folder. Deleting a folder that has no keys succeeds.
    pub async fn delete(&self, ctx: &TenantContext, path: &str) -> FileResult<DeleteReport> {
        let rel = normalize_relative(path)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", path)))?;
        if rel.is_empty() {
            return Err(FileError::invalid("the root folder cannot be deleted"));
        }
        let prefix = self.prefix_for(ctx, &rel)?;

        let keys = object_keys(&self.storage.list_by_prefix(&prefix, false).await?);
        if keys.is_empty() {
            self.index.delete_prefix(&prefix).await?;
            return Ok(DeleteReport::default());
        }

        let mut batch = self.storage.batch_delete(&keys).await;

        // Concurrent creators may have minted placeholders while we deleted.
        let failed: BTreeSet<String> = batch
            .failed_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let remaining = self.storage.list_by_prefix(&prefix, false).await?;
        let strays: Vec<ObjectKey> = object_keys(&remaining)
            .into_iter()
            .filter(|k| k.is_placeholder() && !failed.contains(k.as_str()))
            .collect();
        if !strays.is_empty() {
            debug!(count = strays.len(), prefix = %prefix, "deleting stray placeholders");
            batch.merge(self.storage.batch_delete(&strays).await);
        }

        if batch.errors.is_empty() {
            self.index.delete_prefix(&prefix).await?;
        } else {
            let failed = batch.failed_keys();
            let gone: Vec<String> = keys
                .iter()
                .filter(|k| !failed.contains(k.as_str()))
                .map(|k| k.to_string())
                .collect();
            self.index.delete_many(&gone).await?;
        }

        let errors = batch
            .errors
            .iter()
            .map(|e| PathError::new(relative(ctx, &e.key), &e.error))
            .collect::<Vec<_>>();
        info!(
            tenant = %ctx.tenant_id,
            path = %rel,
            deleted = batch.deleted,
            failed = errors.len(),
            "deleted folder"
        );
        Ok(DeleteReport {
            deleted: batch.deleted,
            errors,
        })
    }

    /// Direct children of a folder, sorted by name. Paths outside the tenant
    /// or folders without keys list as empty.
    pub async fn list(&self, ctx: &TenantContext, path: &str) -> FileResult<DirectoryListing> {
        let Some(prefix) = ctx.dir_prefix(path) else {
            return Ok(DirectoryListing::default());
        };
        let listing = self.storage.list_by_prefix(&prefix, true).await?;

        let mut directories: Vec<DirectoryEntry> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| {
                let rel = ctx.relative_of(p)?;
                let name = file_name_of(rel);
                (!name.is_empty() && !is_placeholder_key(name)).then(|| DirectoryEntry {
                    name: name.to_string(),
                    path: rel.to_string(),
                })
            })
            .collect();
        directories.sort_by(|a, b| a.name.cmp(&b.name));

        let direct: Vec<ObjectInfo> = listing
            .objects
            .iter()
            .filter(|o| is_direct_file(&o.key, &prefix))
            .cloned()
            .collect();

        let mut records = match self
            .index
            .reconcile(ctx.tenant_id.as_str(), &ctx.actor_id, &prefix, &direct)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "index reconciliation failed");
                HashMap::new()
            }
        };

        let mut files: Vec<FileEntry> = direct
            .into_iter()
            .map(|o| FileEntry {
                name: file_name_of(&o.key).to_string(),
                path: relative(ctx, &o.key),
                size: o.size,
                last_modified: o.last_modified,
                record: records.remove(&o.key),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        if self.sweep_due() {
            if let Err(err) = self.sweep_placeholders(ctx).await {
                warn!(tenant = %ctx.tenant_id, error = %err, "placeholder sweep failed");
            }
        }

        Ok(DirectoryListing { directories, files })
    }

    /// Whether a folder has any key below it.
    pub async fn exists(&self, ctx: &TenantContext, path: &str) -> FileResult<bool> {
        match ctx.dir_prefix(path) {
            Some(prefix) => Ok(self.storage.prefix_occupied(&prefix).await?),
            None => Ok(false),
        }
    }

    /// Synthesize the tenant's folder tree from every key it owns.
    pub async fn build_tree(&self, ctx: &TenantContext) -> FileResult<DirectoryNode> {
        let root_prefix = ctx.root_prefix();
        let listing = self.storage.list_by_prefix(&root_prefix, false).await?;

        let mut paths = BTreeSet::new();
        for object in &listing.objects {
            let Some(rel) = ctx.relative_of(&object.key) else {
                continue;
            };
            let mut acc = String::new();
            for segment in parent_of(rel).split('/').filter(|s| !s.is_empty()) {
                acc = join_relative(&acc, segment);
                paths.insert(acc.clone());
            }
        }

        Ok(assemble_tree(paths))
    }

    /// Delete redundant placeholders anywhere under the tenant root: every
    /// marker in a folder that holds anything else, and all but one marker in
    /// an otherwise empty folder.
    pub async fn sweep_placeholders(&self, ctx: &TenantContext) -> FileResult<usize> {
        let listing = self
            .storage
            .list_by_prefix(&ctx.root_prefix(), false)
            .await?;
        let redundant = redundant_markers(&listing.objects);
        if redundant.is_empty() {
            return Ok(0);
        }

        let report = self.storage.batch_delete(&redundant).await;
        debug!(
            tenant = %ctx.tenant_id,
            swept = report.deleted,
            failed = report.errors.len(),
            "swept placeholders"
        );
        Ok(report.deleted)
    }

    /// Mint a root placeholder for a tenant that owns nothing yet.
    pub async fn ensure_root(&self, ctx: &TenantContext) -> FileResult<bool> {
        let root = ctx.root_prefix();
        if self.storage.prefix_occupied(&root).await? {
            return Ok(false);
        }
        let marker = ObjectKey::placeholder_in(&root)?;
        self.storage.put(&marker, Bytes::new()).await?;
        info!(tenant = %ctx.tenant_id, "initialized tenant root");
        Ok(true)
    }

    fn sweep_due(&self) -> bool {
        self.sweep_probability > 0.0 && rand::random::<f64>() < self.sweep_probability
    }

    fn prefix_for(&self, ctx: &TenantContext, relative: &str) -> FileResult<String> {
        ctx.dir_prefix(relative)
            .ok_or_else(|| FileError::invalid(format!("invalid folder path `{}`", relative)))
    }
}

/// Link folder paths into a tree, deepest first, so every node already holds
/// its children when it is attached to its parent.
fn assemble_tree(paths: BTreeSet<String>) -> DirectoryNode {
    let mut nodes: HashMap<String, DirectoryNode> = paths
        .iter()
        .map(|p| (p.clone(), DirectoryNode::new(file_name_of(p), p.clone())))
        .collect();

    let mut order: Vec<&String> = paths.iter().collect();
    order.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));

    let mut root = DirectoryNode::root();
    for path in order {
        let Some(node) = nodes.remove(path) else {
            continue;
        };
        let parent = parent_of(path);
        if parent.is_empty() {
            root.children.push(node);
        } else if let Some(parent_node) = nodes.get_mut(parent) {
            parent_node.children.push(node);
        } else {
            warn!(path = %path, parent = %parent, "folder has no parent node; dropping subtree");
        }
    }

    root.sort_recursive();
    root
}

/// Placeholders whose removal leaves every folder in place, grouped by the
/// folder they sit in.
fn redundant_markers(objects: &[ObjectInfo]) -> Vec<ObjectKey> {
    let mut markers: BTreeMap<&str, Vec<ObjectKey>> = BTreeMap::new();
    let mut occupied: HashSet<&str> = HashSet::new();

    for object in objects {
        let key = object.key.as_str();
        let parent_len = key.rfind('/').map_or(0, |pos| pos + 1);
        let is_marker = is_placeholder_key(key);
        for (pos, _) in key.match_indices('/') {
            // A marker does not keep its own folder occupied.
            if is_marker && pos + 1 == parent_len {
                continue;
            }
            occupied.insert(&key[..=pos]);
        }
        if is_marker {
            if let Ok(marker) = ObjectKey::parse(key) {
                markers.entry(&key[..parent_len]).or_default().push(marker);
            }
        }
    }

    let mut redundant = Vec::new();
    for (dir, mut group) in markers {
        if !occupied.contains(dir) {
            group.sort();
            group.remove(0);
        }
        redundant.extend(group);
    }
    redundant
}

fn object_keys(listing: &Listing) -> Vec<ObjectKey> {
    listing
        .objects
        .iter()
        .filter_map(|o| ObjectKey::parse(&o.key).ok())
        .collect()
}

fn is_direct_file(key: &str, prefix: &str) -> bool {
    let Some(rest) = key.strip_prefix(prefix) else {
        return false;
    };
    !rest.is_empty() && !rest.contains('/') && !is_placeholder_key(rest)
}

fn non_root(path: &str) -> FileResult<String> {
    match normalize_relative(path) {
        Some(rel) if !rel.is_empty() => Ok(rel),
        _ => Err(FileError::invalid(format!("invalid folder path `{}`", path))),
    }
}

/// Copy `from` to `to`, carry its index record forward, then delete `from`.
/// When the record cannot follow, the copy is removed and `from` stays put.
pub(crate) async fn relocate_object(
    storage: &ObjectStorage,
    index: &PathIndex,
    from: &ObjectKey,
    to: &ObjectKey,
) -> FileResult<()> {
    storage.copy(from, to).await?;
    if !from.is_placeholder() {
        if let Err(err) = index.relocate(from, to).await {
            if let Err(cleanup) = storage.delete(to).await {
                warn!(key = %to, error = %cleanup, "copy left behind by a failed move");
            }
            return Err(err);
        }
    }
    storage.delete(from).await?;
    Ok(())
}

pub(crate) fn parent_of(relative: &str) -> &str {
    relative.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

pub(crate) fn relative(ctx: &TenantContext, key: &str) -> String {
    ctx.relative_of(key).unwrap_or(key).to_string()
}
