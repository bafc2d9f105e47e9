//! Outcome types for operations that can partially succeed.
//!
//! Batch operations never abort on a single item; they report what went
//! through and what failed, per path.

use serde::Serialize;

/// A per-item failure inside a batch.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PathError {
    pub path: String,
    pub error: String,
}

impl PathError {
    pub fn new(path: impl Into<String>, error: impl ToString) -> Self {
        Self {
            path: path.into(),
            error: error.to_string(),
        }
    }
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    pub errors: Vec<PathError>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MovedFile {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct MoveReport {
    pub moved: Vec<MovedFile>,
    pub errors: Vec<PathError>,
}

impl MoveReport {
    /// Human-readable summary, e.g. `3 moved, 1 failed: a.txt: file not found`.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return format!("{} moved", self.moved.len());
        }
        let details = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.error))
            .collect::<Vec<_>>()
            .join("; ");
        format!(
            "{} moved, {} failed: {}",
            self.moved.len(),
            self.errors.len(),
            details
        )
    }
}

/// Result of renaming or moving a whole folder.
#[derive(Serialize, Clone, Debug)]
pub struct TreeMove {
    /// New tenant-relative folder path.
    pub path: String,

    /// Number of objects (placeholders included) relocated.
    pub moved: usize,

    pub errors: Vec<PathError>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedFile {
    /// Tenant-relative path the content was stored at.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,

    /// MD5 hex digest of the content.
    pub etag: String,
}
