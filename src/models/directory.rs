//! Synthesized directory views: the folder tree and single-level listings.

use super::file_record::FileRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Name given to the tenant root node.
pub const ROOT_NAME: &str = "Home";

/// One folder in the synthesized tree. Never stored; rebuilt from key prefixes.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectoryNode {
    pub name: String,

    /// Tenant-relative path; `""` for the root.
    pub path: String,

    pub children: Vec<DirectoryNode>,
}

impl DirectoryNode {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            children: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_NAME, "")
    }

    /// Depth-first lookup by tenant-relative path.
    pub fn find(&self, path: &str) -> Option<&DirectoryNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    pub(crate) fn sort_recursive(&mut self) {
        self.children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in &mut self.children {
            child.sort_recursive();
        }
    }
}

/// A direct child folder in a listing.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
}

/// A direct child file in a listing.
#[derive(Serialize, Clone, Debug)]
pub struct FileEntry {
    pub name: String,

    /// Tenant-relative path.
    pub path: String,

    pub size: u64,
    pub last_modified: DateTime<Utc>,

    /// Path Index row, reconciled during the listing. `None` only when the
    /// index write failed.
    pub record: Option<FileRecord>,
}

impl FileEntry {
    pub fn file_type(&self) -> String {
        super::object_key::file_type_of(&self.name)
    }
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct DirectoryListing {
    pub directories: Vec<DirectoryEntry>,
    pub files: Vec<FileEntry>,
}

impl DirectoryListing {
    pub fn directory_names(&self) -> Vec<&str> {
        self.directories.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }
}
