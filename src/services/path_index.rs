//! Path Index: SQLite shadow of the object store.
//!
//! Maps object keys to user metadata (tags, favorite flag, note) and cached
//! derived fields (size, type). The object store stays authoritative; every
//! write here is a single-row upsert keyed by the unique `path` column, so
//! concurrent writers can interleave without corrupting the table.

use super::error::FileResult;
use crate::models::{
    file_record::{FileRecord, MetadataUpdate, Tag},
    object_key::{ObjectKey, file_type_of},
};
use crate::services::storage::ObjectInfo;
use chrono::Utc;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Color given to tags created implicitly by save-metadata.
pub const DEFAULT_TAG_COLOR: &str = "#6c757d";

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "id, tenant_id, path, filename, file_type, file_size, owner_id, \
                              is_favorite, note, updated_at";

/// Bound parameters per `IN (...)` query.
const BIND_CHUNK: usize = 500;

#[derive(FromRow)]
struct TagLink {
    record_id: Uuid,
    id: Uuid,
    name: String,
    color: String,
}

#[derive(Clone)]
pub struct PathIndex {
    db: Arc<SqlitePool>,
}

impl PathIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> FileResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn ping(&self) -> FileResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> FileResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE path = ?",
            RECORD_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        match record {
            Some(record) => {
                let mut records = vec![record];
                self.attach_tags(&mut records).await?;
                Ok(records.pop())
            }
            None => Ok(None),
        }
    }

    /// Every record whose key starts with `prefix`, ordered by path.
    pub async fn records_under(&self, prefix: &str) -> FileResult<Vec<FileRecord>> {
        let mut records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE path >= ? AND path < ? ORDER BY path",
            RECORD_COLUMNS
        ))
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .fetch_all(&*self.db)
        .await?;

        self.attach_tags(&mut records).await?;
        Ok(records)
    }

    /// Records of files directly inside `dir_prefix`, keyed by path.
    pub async fn records_in_dir(
        &self,
        dir_prefix: &str,
    ) -> FileResult<HashMap<String, FileRecord>> {
        Ok(self
            .records_under(dir_prefix)
            .await?
            .into_iter()
            .filter(|r| !r.path[dir_prefix.len()..].contains('/'))
            .map(|r| (r.path.clone(), r))
            .collect())
    }

    /// Record that an object with `size` exists at `key`: insert when absent,
    /// refresh the size when it changed.
    pub async fn observe(
        &self,
        tenant_id: &str,
        owner_id: &str,
        key: &ObjectKey,
        size: u64,
    ) -> FileResult<FileRecord> {
        let mut conn = self.db.acquire().await?;
        let mut record = upsert_record(&mut *conn, tenant_id, owner_id, key, size).await?;
        drop(conn);

        let mut records = vec![record.clone()];
        self.attach_tags(&mut records).await?;
        if let Some(with_tags) = records.pop() {
            record = with_tags;
        }
        Ok(record)
    }

    /// Bring the records of one directory in line with a fresh listing.
    ///
    /// Missing records are created, stale sizes refreshed, and records whose
    /// object disappeared are dropped. Returns the record for every object.
    pub async fn reconcile(
        &self,
        tenant_id: &str,
        owner_id: &str,
        dir_prefix: &str,
        objects: &[ObjectInfo],
    ) -> FileResult<HashMap<String, FileRecord>> {
        let mut known = self.records_in_dir(dir_prefix).await?;
        let mut result = HashMap::with_capacity(objects.len());

        for object in objects {
            let size_matches = known
                .get(&object.key)
                .is_some_and(|r| r.file_size == object.size as i64);
            if size_matches {
                if let Some(record) = known.remove(&object.key) {
                    result.insert(object.key.clone(), record);
                }
                continue;
            }
            known.remove(&object.key);

            let Ok(key) = ObjectKey::parse(&object.key) else {
                continue;
            };
            let record = self.observe(tenant_id, owner_id, &key, object.size).await?;
            result.insert(object.key.clone(), record);
        }

        if !known.is_empty() {
            let stale: Vec<String> = known.into_keys().collect();
            for path in &stale {
                warn!(path = %path, "index record has no object; removing");
            }
            self.delete_many(&stale).await?;
        }

        Ok(result)
    }

    /// Apply a partial metadata update, creating the record when absent.
    pub async fn save_metadata(
        &self,
        tenant_id: &str,
        owner_id: &str,
        key: &ObjectKey,
        size: u64,
        update: &MetadataUpdate,
    ) -> FileResult<FileRecord> {
        let mut tx = self.db.begin().await?;
        let record = upsert_record(&mut *tx, tenant_id, owner_id, key, size).await?;

        if let Some(note) = &update.note {
            sqlx::query("UPDATE file_records SET note = ?, updated_at = ? WHERE id = ?")
                .bind(note)
                .bind(Utc::now())
                .bind(record.id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(favorite) = update.favorite {
            sqlx::query("UPDATE file_records SET is_favorite = ?, updated_at = ? WHERE id = ?")
                .bind(favorite)
                .bind(Utc::now())
                .bind(record.id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(tags) = &update.tags {
            sqlx::query("DELETE FROM file_record_tags WHERE record_id = ?")
                .bind(record.id)
                .execute(&mut *tx)
                .await?;

            let names: BTreeSet<&str> = tags
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect();
            for name in names {
                let tag_id = ensure_tag(&mut *tx, tenant_id, name).await?;
                sqlx::query(
                    "INSERT OR IGNORE INTO file_record_tags (record_id, tag_id) VALUES (?, ?)",
                )
                .bind(record.id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        debug!(path = %key, "saved metadata");
        self.get(key.as_str())
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    /// Move a record to a new key, keeping its id and therefore its tags,
    /// note and favorite flag. Any stale record already at `to` is replaced.
    pub async fn relocate(
        &self,
        from: &ObjectKey,
        to: &ObjectKey,
    ) -> FileResult<Option<FileRecord>> {
        let mut tx = self.db.begin().await?;
        delete_paths(&mut *tx, &[to.as_str()]).await?;

        let updated = sqlx::query(
            "UPDATE file_records SET path = ?, filename = ?, file_type = ?, updated_at = ?
             WHERE path = ?",
        )
        .bind(to.as_str())
        .bind(to.file_name())
        .bind(file_type_of(to.file_name()))
        .bind(Utc::now())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(to.as_str()).await
    }

    pub async fn delete(&self, key: &str) -> FileResult<u64> {
        self.delete_many(&[key.to_string()]).await
    }

    pub async fn delete_many(&self, keys: &[String]) -> FileResult<u64> {
        let mut removed = 0;
        let mut tx = self.db.begin().await?;
        for chunk in keys.chunks(BIND_CHUNK) {
            let paths: Vec<&str> = chunk.iter().map(String::as_str).collect();
            removed += delete_paths(&mut *tx, &paths).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Drop every record under a directory prefix.
    pub async fn delete_prefix(&self, prefix: &str) -> FileResult<u64> {
        let upper = prefix_upper_bound(prefix);
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM file_record_tags WHERE record_id IN
             (SELECT id FROM file_records WHERE path >= ? AND path < ?)",
        )
        .bind(prefix)
        .bind(&upper)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM file_records WHERE path >= ? AND path < ?")
            .bind(prefix)
            .bind(&upper)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn tags(&self, tenant_id: &str) -> FileResult<Vec<Tag>> {
        Ok(sqlx::query_as::<_, Tag>(
            "SELECT id, name, color FROM tags WHERE tenant_id = ? ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&*self.db)
        .await?)
    }

    async fn attach_tags(&self, records: &mut [FileRecord]) -> FileResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut by_record: HashMap<Uuid, Vec<Tag>> = HashMap::new();
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        for chunk in ids.chunks(BIND_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT frt.record_id, t.id, t.name, t.color
                 FROM file_record_tags frt JOIN tags t ON t.id = frt.tag_id
                 WHERE frt.record_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") ORDER BY t.name");

            let links: Vec<TagLink> = builder.build_query_as().fetch_all(&*self.db).await?;
            for link in links {
                by_record.entry(link.record_id).or_default().push(Tag {
                    id: link.id,
                    name: link.name,
                    color: link.color,
                });
            }
        }

        for record in records.iter_mut() {
            record.tags = by_record.remove(&record.id).unwrap_or_default();
        }
        Ok(())
    }
}

async fn upsert_record(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    owner_id: &str,
    key: &ObjectKey,
    size: u64,
) -> sqlx::Result<FileRecord> {
    sqlx::query_as::<_, FileRecord>(&format!(
        r#"
        INSERT INTO file_records (
            id, tenant_id, path, filename, file_type, file_size,
            owner_id, is_favorite, note, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, '', ?)
        ON CONFLICT(path) DO UPDATE SET
            file_size = excluded.file_size,
            updated_at = CASE
                WHEN file_records.file_size = excluded.file_size THEN file_records.updated_at
                ELSE excluded.updated_at
            END
        RETURNING {}
        "#,
        RECORD_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(key.as_str())
    .bind(key.file_name())
    .bind(file_type_of(key.file_name()))
    .bind(size as i64)
    .bind(owner_id)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
}

async fn ensure_tag(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    name: &str,
) -> sqlx::Result<Uuid> {
    sqlx::query(
        "INSERT INTO tags (id, tenant_id, name, color) VALUES (?, ?, ?, ?)
         ON CONFLICT(tenant_id, name) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(name)
    .bind(DEFAULT_TAG_COLOR)
    .execute(&mut *conn)
    .await?;

    sqlx::query_scalar::<_, Uuid>("SELECT id FROM tags WHERE tenant_id = ? AND name = ?")
        .bind(tenant_id)
        .bind(name)
        .fetch_one(&mut *conn)
        .await
}

async fn delete_paths(conn: &mut SqliteConnection, paths: &[&str]) -> sqlx::Result<u64> {
    if paths.is_empty() {
        return Ok(0);
    }

    let mut links: QueryBuilder<Sqlite> = QueryBuilder::new(
        "DELETE FROM file_record_tags \
         WHERE record_id IN (SELECT id FROM file_records WHERE path IN (",
    );
    let mut separated = links.separated(", ");
    for path in paths {
        separated.push_bind(*path);
    }
    separated.push_unseparated("))");
    links.build().execute(&mut *conn).await?;

    let mut rows: QueryBuilder<Sqlite> =
        QueryBuilder::new("DELETE FROM file_records WHERE path IN (");
    let mut separated = rows.separated(", ");
    for path in paths {
        separated.push_bind(*path);
    }
    separated.push_unseparated(")");
    Ok(rows.build().execute(&mut *conn).await?.rows_affected())
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_upper_bound(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return chars.into_iter().collect();
        }
    }
    // Empty prefix: every path is below U+10FFFF.
    char::MAX.to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn memory_index() -> PathIndex {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let index = PathIndex::new(Arc::new(pool));
        index.migrate().await.unwrap();
        index
    }

    fn key(raw: &str) -> ObjectKey {
        ObjectKey::parse(raw).unwrap()
    }

    #[test]
    fn upper_bound_excludes_sibling_prefixes() {
        assert_eq!(prefix_upper_bound("t1/docs/"), "t1/docs0");
        assert!("t1/docs/a.txt" < prefix_upper_bound("t1/docs/").as_str());
        assert!("t1/docs0" >= prefix_upper_bound("t1/docs/").as_str());
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let index = memory_index().await;
        assert_eq!(index.migrate().await.unwrap(), 4);
        index.ping().await.unwrap();
    }

    #[tokio::test]
    async fn observe_inserts_then_refreshes_size() {
        let index = memory_index().await;
        let k = key("t1/docs/a.TXT");
        let first = index.observe("t1", "u1", &k, 3).await.unwrap();
        assert_eq!(first.filename, "a.TXT");
        assert_eq!(first.file_type, "txt");
        assert_eq!(first.owner_id, "u1");

        let second = index.observe("t1", "u2", &k, 9).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.file_size, 9);
        assert_eq!(second.owner_id, "u1");
    }

    #[tokio::test]
    async fn tags_are_scoped_per_tenant_and_survive_relocation() {
        let index = memory_index().await;
        let update = MetadataUpdate {
            note: Some("quarterly".into()),
            tags: Some(vec!["finance".into(), " finance ".into(), "q1".into()]),
            favorite: Some(true),
        };
        let saved = index
            .save_metadata("t1", "u1", &key("t1/r/q1.csv"), 10, &update)
            .await
            .unwrap();
        assert_eq!(saved.tag_names(), ["finance", "q1"]);
        assert!(saved.is_favorite);
        assert_eq!(saved.tags[0].color, DEFAULT_TAG_COLOR);

        index
            .save_metadata("t2", "u9", &key("t2/x.csv"), 1, &MetadataUpdate {
                tags: Some(vec!["finance".into()]),
                ..MetadataUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(index.tags("t1").await.unwrap().len(), 2);
        assert_eq!(index.tags("t2").await.unwrap().len(), 1);

        let moved = index
            .relocate(&key("t1/r/q1.csv"), &key("t1/archive/q1.csv"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.id, saved.id);
        assert_eq!(moved.note, "quarterly");
        assert!(moved.has_tag("q1"));
        assert!(index.get("t1/r/q1.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_creates_refreshes_and_drops() {
        let index = memory_index().await;
        index.observe("t1", "u1", &key("t1/d/gone.txt"), 1).await.unwrap();
        index.observe("t1", "u1", &key("t1/d/a.txt"), 1).await.unwrap();
        index.observe("t1", "u1", &key("t1/d/sub/deep.txt"), 1).await.unwrap();

        let now = Utc::now();
        let objects = vec![
            ObjectInfo { key: "t1/d/a.txt".into(), size: 5, last_modified: now },
            ObjectInfo { key: "t1/d/b.txt".into(), size: 2, last_modified: now },
        ];
        let records = index.reconcile("t1", "u1", "t1/d/", &objects).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["t1/d/a.txt"].file_size, 5);
        assert!(index.get("t1/d/gone.txt").await.unwrap().is_none());
        assert!(index.get("t1/d/sub/deep.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_prefix_keeps_sibling_directories() {
        let index = memory_index().await;
        for k in ["t1/docs/a", "t1/docs/b/c", "t1/docs0", "t1/docsx/a"] {
            index.observe("t1", "u1", &key(k), 0).await.unwrap();
        }
        assert_eq!(index.delete_prefix("t1/docs/").await.unwrap(), 2);
        assert_eq!(index.records_under("t1/").await.unwrap().len(), 2);
    }
}
