//! Tenant Scoping Filter.
//!
//! Clients only ever see tenant-relative paths. Everything that reaches the
//! object store goes through [`TenantContext`], which normalizes the path and
//! prefixes the tenant root, so no request can address another namespace.

use super::error::{FileError, FileResult};
use crate::models::object_key::{ObjectKey, PLACEHOLDER_PREFIX, TEMP_PREFIX};
use serde::Serialize;
use std::fmt;

const MAX_TENANT_ID_LEN: usize = 64;

/// Validated tenant identifier: 1-64 chars of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> FileResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(FileError::invalid(format!("invalid tenant id `{}`", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The acting tenant and user of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub actor_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor_id: actor_id.into(),
        }
    }

    /// `"{tenant}/"`, the prefix every key of this tenant starts with.
    pub fn root_prefix(&self) -> String {
        format!("{}/", self.tenant_id)
    }

    /// Directory prefix (ending in `/`) for a tenant-relative folder path.
    /// `None` when the path escapes the tenant root.
    pub fn dir_prefix(&self, relative: &str) -> Option<String> {
        let normalized = normalize_relative(relative)?;
        if normalized.is_empty() {
            Some(self.root_prefix())
        } else {
            Some(format!("{}/{}/", self.tenant_id, normalized))
        }
    }

    /// Object key for a tenant-relative file path. The root itself is not a key.
    pub fn object_key(&self, relative: &str) -> Option<ObjectKey> {
        let normalized = normalize_relative(relative)?;
        if normalized.is_empty() {
            return None;
        }
        ObjectKey::parse(&format!("{}/{}", self.tenant_id, normalized)).ok()
    }

    /// Tenant-relative form of a full key or prefix owned by this tenant.
    pub fn relative_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.tenant_id.as_str())?
            .strip_prefix('/')
            .map(|rest| rest.trim_end_matches('/'))
    }

    pub fn owns(&self, key: &str) -> bool {
        self.relative_of(key).is_some()
    }
}

/// Normalize a client path: backslashes become `/`, empty and `.` segments
/// are dropped, `..` or control characters reject the whole path.
pub fn normalize_relative(raw: &str) -> Option<String> {
    if raw.chars().any(char::is_control) {
        return None;
    }
    let replaced = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }
    Some(segments.join("/"))
}

/// Validate a user-supplied file or folder name and reduce it to a basename.
pub fn sanitize_name(raw: &str) -> FileResult<String> {
    let replaced = raw.replace('\\', "/");
    let name = replaced.rsplit('/').next().unwrap_or_default().trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(FileError::invalid(format!("invalid name `{}`", raw)));
    }
    if name.chars().any(char::is_control) {
        return Err(FileError::invalid("names cannot contain control characters"));
    }
    if let Some(prefix) = [PLACEHOLDER_PREFIX, TEMP_PREFIX]
        .into_iter()
        .find(|prefix| name.starts_with(*prefix))
    {
        return Err(FileError::invalid(format!(
            "names starting with `{}` are reserved",
            prefix
        )));
    }
    Ok(name.to_string())
}

/// Join a tenant-relative directory and a child name.
pub fn join_relative(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tenant: &str) -> TenantContext {
        TenantContext::new(TenantId::parse(tenant).unwrap(), "u1")
    }

    #[test]
    fn tenant_ids_are_restricted() {
        assert!(TenantId::parse("T1_a-b").is_ok());
        for bad in ["", "a/b", "a b", "..", &"x".repeat(65)] {
            assert!(TenantId::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn paths_are_normalized_under_the_tenant_root() {
        let t = ctx("T1");
        assert_eq!(t.dir_prefix("").as_deref(), Some("T1/"));
        assert_eq!(t.dir_prefix("/reports//2024/").as_deref(), Some("T1/reports/2024/"));
        assert_eq!(t.dir_prefix("a\\.\\b").as_deref(), Some("T1/a/b/"));
        assert_eq!(t.object_key("reports/q1.csv").unwrap().as_str(), "T1/reports/q1.csv");
        assert!(t.object_key("").is_none());
    }

    #[test]
    fn traversal_never_leaves_the_tenant() {
        let t = ctx("T1");
        assert!(t.dir_prefix("../T2").is_none());
        assert!(t.object_key("a/../../T2/secret").is_none());
        assert!(t.object_key("a\u{0}b").is_none());
    }

    #[test]
    fn relative_of_strips_only_own_root() {
        let t = ctx("T1");
        assert_eq!(t.relative_of("T1/reports/q1.csv"), Some("reports/q1.csv"));
        assert_eq!(t.relative_of("T1/reports/"), Some("reports"));
        assert_eq!(t.relative_of("T10/x"), None);
        assert!(!t.owns("T2/x"));
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("  notes.txt ").unwrap(), "notes.txt");
        assert_eq!(sanitize_name("C:\\tmp\\a.txt").unwrap(), "a.txt");
        for bad in ["", "  ", ".", "..", ".keep", ".keep_1234abcd", "a\tb"] {
            assert!(sanitize_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn temp_file_names_are_reserved() {
        let err = sanitize_name("d/.tmp-notes.txt").unwrap_err();
        assert!(err.to_string().contains(".tmp-"));
        assert_eq!(sanitize_name("tmp-notes.txt").unwrap(), "tmp-notes.txt");
    }
}
