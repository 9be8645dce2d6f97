use crate::build_insert_sql;
use crate::errors::{ErrorKind, Result};
use crate::models::{
    FileRecord, ImageMetadata, IndexStats, Tag, TagSource, Timestamp, Visibility, WatchedFolder,
};
use crate::services::events::{EngineEvent, EventBus};
use crate::store::Store;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Owner of the folder/file/tag tables. The scanner writes file rows through
/// this service's store handle; remote rows belong to the sync service.
pub struct IndexService {
    store: Store,
    events: Arc<EventBus>,
}

impl IndexService {
    pub fn new(store: Store, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn add_folder(
        &self,
        path: &Path,
        name: Option<String>,
        visibility: Visibility,
    ) -> Result<i64> {
        let canonical = path
            .canonicalize()
            .map_err(|_| ErrorKind::NotFound)?
            .to_string_lossy()
            .to_string();
        let existing = sqlx::query("SELECT id FROM watched_folders WHERE path = ?")
            .bind(&canonical)
            .fetch_optional(self.store.pool())
            .await?;
        if existing.is_some() {
            return Err(ErrorKind::AlreadyExists(canonical));
        }
        let name = name.unwrap_or_else(|| {
            Path::new(&canonical)
                .file_name()
                .map(|it| it.to_string_lossy().to_string())
                .unwrap_or_else(|| canonical.clone())
        });
        let (sql, args) = build_insert_sql!(
            "watched_folders",
            [
                ("path", &canonical),
                ("name", &name),
                ("visibility", visibility.as_i64()),
                ("enabled", 1_i64)
            ]
        );
        let result = sqlx::query_with(&sql, args)
            .execute(self.store.pool())
            .await?;
        let id = result.last_insert_rowid();
        tracing::info!(target: "event", "folder added [id={id}] [path={canonical}]");
        self.events.send(EngineEvent::IndexChanged);
        Ok(id)
    }

    pub async fn remove_folder(&self, id: i64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        // Deletions must survive to the next sync round as tombstones.
        let now = Timestamp::now().millis();
        sqlx::query(
            "INSERT OR REPLACE INTO tombstones (file_id, deleted_at) \
             SELECT id, ? FROM files WHERE folder_id = ? AND source_device_id IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM watched_folders WHERE id = ? RETURNING id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if deleted.is_none() {
            return Err(ErrorKind::NotFound);
        }
        tx.commit().await?;
        tracing::info!(target: "event", "folder removed [id={id}]");
        self.events.send(EngineEvent::IndexChanged);
        Ok(())
    }

    pub async fn set_folder_visibility(&self, id: i64, visibility: Visibility) -> Result<()> {
        let result = sqlx::query("UPDATE watched_folders SET visibility = ? WHERE id = ?")
            .bind(visibility.as_i64())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ErrorKind::NotFound);
        }
        Ok(())
    }

    pub async fn set_folder_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE watched_folders SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ErrorKind::NotFound);
        }
        Ok(())
    }

    pub async fn get_folders(&self) -> Result<Vec<WatchedFolder>> {
        let sql = format!(
            "SELECT {} FROM watched_folders ORDER BY name COLLATE NOCASE",
            WatchedFolder::COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.pool()).await?;
        let mut folders = Vec::with_capacity(rows.len());
        for row in &rows {
            folders.push(WatchedFolder::from_row(row)?);
        }
        Ok(folders)
    }

    pub async fn get_folder(&self, id: i64) -> Result<WatchedFolder> {
        let sql = format!(
            "SELECT {} FROM watched_folders WHERE id = ?",
            WatchedFolder::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(ErrorKind::NotFound)?;
        Ok(WatchedFolder::from_row(&row)?)
    }

    pub async fn get_file(&self, id: i64) -> Result<FileRecord> {
        let sql = format!("SELECT {} FROM files WHERE id = ?", FileRecord::COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(ErrorKind::NotFound)?;
        Ok(FileRecord::from_row(&row)?)
    }

    /// Absolute path of a local file row.
    pub async fn resolve_full_path(&self, file: &FileRecord) -> Result<PathBuf> {
        let folder_id = file.folder_id.ok_or(ErrorKind::NotFound)?;
        let relative = file.relative_path.as_deref().ok_or(ErrorKind::NotFound)?;
        let folder = self.get_folder(folder_id).await?;
        Ok(Path::new(&folder.path).join(relative))
    }

    pub async fn get_recent(&self, limit: u32) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE source_device_id IS NULL \
             ORDER BY modified_at DESC LIMIT ?",
            FileRecord::COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?;
        let mut files = Vec::with_capacity(rows.len());
        for row in &rows {
            files.push(FileRecord::from_row(row)?);
        }
        Ok(files)
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        let rows = sqlx::query(
            "SELECT content_type, COUNT(*) AS c, COALESCE(SUM(size), 0) AS s \
             FROM files WHERE source_device_id IS NULL GROUP BY content_type",
        )
        .fetch_all(self.store.pool())
        .await?;
        for row in rows {
            let content_type = crate::models::ContentType::from_i64(row.try_get("content_type")?);
            let count: i64 = row.try_get("c")?;
            stats.bump(content_type, count);
            stats.total_files += count;
            stats.total_size += row.try_get::<i64, _>("s")?;
        }
        stats.folder_count = sqlx::query("SELECT COUNT(*) AS c FROM watched_folders")
            .fetch_one(self.store.pool())
            .await?
            .try_get("c")?;
        Ok(stats)
    }

    pub async fn get_image_metadata(&self, file_id: i64) -> Result<Option<ImageMetadata>> {
        let row = sqlx::query(
            "SELECT file_id, width, height, taken_at, camera_make, camera_model, \
             latitude, longitude, orientation FROM image_metadata WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(match row {
            Some(row) => Some(ImageMetadata {
                file_id: row.try_get("file_id")?,
                width: row.try_get("width")?,
                height: row.try_get("height")?,
                taken_at: row
                    .try_get::<Option<i64>, _>("taken_at")?
                    .map(Timestamp::from),
                camera_make: row.try_get("camera_make")?,
                camera_model: row.try_get("camera_model")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                orientation: row.try_get("orientation")?,
            }),
            None => None,
        })
    }

    /// Idempotent: tagging the same file twice with the same name (any case)
    /// leaves a single row.
    pub async fn add_tag(&self, file_id: i64, name: &str, source: TagSource) -> Result<Tag> {
        self.get_file(file_id).await?;
        sqlx::query("INSERT OR IGNORE INTO tags (name, source) VALUES (?, ?)")
            .bind(name)
            .bind(source.as_i64())
            .execute(self.store.pool())
            .await?;
        let row = sqlx::query("SELECT id, name, source FROM tags WHERE name = ? COLLATE NOCASE")
            .bind(name)
            .fetch_one(self.store.pool())
            .await?;
        let tag = Tag::from_row(&row)?;
        sqlx::query("INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?, ?)")
            .bind(file_id)
            .bind(tag.id)
            .execute(self.store.pool())
            .await?;
        Ok(tag)
    }

    pub async fn remove_tag(&self, file_id: i64, name: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM file_tags WHERE file_id = ? \
             AND tag_id IN (SELECT id FROM tags WHERE name = ? COLLATE NOCASE)",
        )
        .bind(file_id)
        .bind(name)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(ErrorKind::NotFound);
        }
        Ok(())
    }

    pub async fn get_all_tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name, source FROM tags ORDER BY name COLLATE NOCASE")
            .fetch_all(self.store.pool())
            .await?;
        let mut tags = Vec::with_capacity(rows.len());
        for row in &rows {
            tags.push(Tag::from_row(row)?);
        }
        Ok(tags)
    }

    pub async fn get_tags_for_file(&self, file_id: i64) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT t.id, t.name, t.source FROM tags t \
             JOIN file_tags ft ON ft.tag_id = t.id \
             WHERE ft.file_id = ? ORDER BY t.name COLLATE NOCASE",
        )
        .bind(file_id)
        .fetch_all(self.store.pool())
        .await?;
        let mut tags = Vec::with_capacity(rows.len());
        for row in &rows {
            tags.push(Tag::from_row(row)?);
        }
        Ok(tags)
    }
}
