//! Path Index entries: per-object metadata kept in SQLite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for one stored object.
///
/// The object store stays authoritative for existence and size; this row only
/// caches derived fields and holds the user-supplied ones (tags, favorite, note).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Internal UUID, stable across renames and moves.
    pub id: Uuid,

    /// Tenant owning the namespace the object lives in.
    pub tenant_id: String,

    /// Full object key; unique.
    pub path: String,

    /// Final segment of `path`.
    pub filename: String,

    /// Lower-cased extension without the dot.
    pub file_type: String,

    /// Size in bytes as last observed in the object store.
    pub file_size: i64,

    /// Actor that first caused the record to exist.
    pub owner_id: String,

    pub is_favorite: bool,

    /// Freeform note.
    pub note: String,

    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    pub tags: Vec<Tag>,
}

impl FileRecord {
    pub fn tag_names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }
}

/// A label attached to file records, unique per tenant by name.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub color: String,
}

/// Partial update applied by save-metadata. `None` leaves a field untouched;
/// `tags: Some(vec![])` clears all tags.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct MetadataUpdate {
    pub note: Option<String>,
    pub tags: Option<Vec<String>>,
    pub favorite: Option<bool>,
}
