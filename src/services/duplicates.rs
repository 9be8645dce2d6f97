use crate::errors::{ErrorKind, InternalError, Result};
use crate::models::{FileRecord, Timestamp};
use crate::services::events::{EngineEvent, EventBus};
use crate::store::Store;
use serde::Serialize;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub checksum: String,
    pub file_size: i64,
    pub local_copies: Vec<FileRecord>,
    pub remote_copies: Vec<FileRecord>,
    /// Bytes reclaimed by keeping a single local copy.
    pub potential_savings: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateStats {
    pub group_count: i64,
    pub duplicate_files: i64,
    pub wasted_bytes: i64,
}

/// Groups local rows by checksum. Remote rows are reported per group but
/// never participate as deletable members; their bytes belong to a peer.
pub struct DuplicateService {
    store: Store,
    events: Arc<EventBus>,
}

impl DuplicateService {
    pub fn new(store: Store, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn find_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        let groups = sqlx::query(
            "SELECT checksum, size, COUNT(*) AS copies FROM files \
             WHERE source_device_id IS NULL AND checksum IS NOT NULL \
             GROUP BY checksum HAVING copies > 1 \
             ORDER BY size * (copies - 1) DESC",
        )
        .fetch_all(self.store.pool())
        .await?;
        let mut result = Vec::with_capacity(groups.len());
        for group in groups {
            let checksum: String = group.try_get("checksum")?;
            let size: i64 = group.try_get("size")?;
            let copies: i64 = group.try_get("copies")?;
            result.push(DuplicateGroup {
                local_copies: self.files_by_checksum(&checksum, false).await?,
                remote_copies: self.files_by_checksum(&checksum, true).await?,
                checksum,
                file_size: size,
                potential_savings: size * (copies - 1),
            });
        }
        Ok(result)
    }

    pub async fn get_stats(&self) -> Result<DuplicateStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS groups, COALESCE(SUM(copies - 1), 0) AS extra, \
             COALESCE(SUM(size * (copies - 1)), 0) AS wasted FROM ( \
               SELECT size, COUNT(*) AS copies FROM files \
               WHERE source_device_id IS NULL AND checksum IS NOT NULL \
               GROUP BY checksum HAVING copies > 1)",
        )
        .fetch_one(self.store.pool())
        .await?;
        Ok(DuplicateStats {
            group_count: row.try_get("groups")?,
            duplicate_files: row.try_get("extra")?,
            wasted_bytes: row.try_get("wasted")?,
        })
    }

    /// Local files whose checksum has no remote copy anywhere in the family.
    pub async fn find_files_without_backup(&self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files f WHERE f.source_device_id IS NULL \
             AND f.checksum IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM files r WHERE r.source_device_id IS NOT NULL \
                             AND r.checksum = f.checksum) \
             ORDER BY f.size DESC",
            FileRecord::COLUMNS
                .split(", ")
                .map(|c| format!("f.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.pool()).await?;
        let mut files = Vec::with_capacity(rows.len());
        for row in &rows {
            files.push(FileRecord::from_row(row)?);
        }
        Ok(files)
    }

    /// Delete a single local file, row and bytes together. A filesystem
    /// failure aborts the store deletion.
    pub async fn delete_file(&self, file_id: i64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let full_path = self.delete_row(&mut tx, file_id).await?;
        if let Err(err) = remove_from_disk(&full_path).await {
            tracing::error!(reason = %err, "failed to delete {:?}, rolling back", full_path);
            return Err(err);
        }
        tx.commit().await?;
        tracing::info!(target: "event", "file deleted [id={file_id}]");
        self.events.send(EngineEvent::IndexChanged);
        Ok(())
    }

    /// Keep `keep_id` and delete every other local copy of `checksum` in one
    /// transaction.
    pub async fn keep_only_one(&self, checksum: &str, keep_id: i64) -> Result<u64> {
        let losers = sqlx::query(
            "SELECT id FROM files WHERE source_device_id IS NULL AND checksum = ? AND id != ?",
        )
        .bind(checksum)
        .bind(keep_id)
        .fetch_all(self.store.pool())
        .await?;
        if losers.is_empty() {
            return Ok(0);
        }
        // verify the keeper is actually in the group
        sqlx::query("SELECT id FROM files WHERE id = ? AND checksum = ?")
            .bind(keep_id)
            .bind(checksum)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(ErrorKind::NotFound)?;
        let mut tx = self.store.begin().await?;
        let mut removed = 0;
        for row in losers {
            let id: i64 = row.try_get("id")?;
            let full_path = self.delete_row(&mut tx, id).await?;
            if let Err(err) = remove_from_disk(&full_path).await {
                tracing::error!(reason = %err, "failed to delete {:?}, rolling back group", full_path);
                return Err(err);
            }
            removed += 1;
        }
        tx.commit().await?;
        tracing::info!(target: "event", "duplicates removed [checksum={checksum}] [count={removed}]");
        self.events.send(EngineEvent::IndexChanged);
        Ok(removed)
    }

    async fn delete_row(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        file_id: i64,
    ) -> Result<PathBuf> {
        let row = sqlx::query(
            "SELECT f.relative_path, w.path AS folder_path FROM files f \
             JOIN watched_folders w ON w.id = f.folder_id \
             WHERE f.id = ? AND f.source_device_id IS NULL",
        )
        .bind(file_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ErrorKind::NotFound)?;
        let full_path = PathBuf::from(row.try_get::<String, _>("folder_path")?)
            .join(row.try_get::<String, _>("relative_path")?);
        sqlx::query("INSERT OR REPLACE INTO tombstones (file_id, deleted_at) VALUES (?, ?)")
            .bind(file_id)
            .bind(Timestamp::now().millis())
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut **tx)
            .await?;
        Ok(full_path)
    }
}

async fn remove_from_disk(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        // already gone is fine; the row was stale
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ErrorKind::io_context(
            err,
            InternalError::DeleteFileError {
                path: path.to_owned(),
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn fixture(dir: &Path) -> DuplicateService {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO watched_folders (path, name) VALUES (?, 'dup')")
            .bind(dir.to_string_lossy().to_string())
            .execute(store.pool())
            .await
            .unwrap();
        DuplicateService::new(store, Arc::new(EventBus::new()))
    }

    async fn insert_local(service: &DuplicateService, rel: &str, size: i64, checksum: &str) -> i64 {
        sqlx::query(
            "INSERT INTO files (folder_id, relative_path, name, size, checksum) \
             VALUES (1, ?, ?, ?, ?) RETURNING id",
        )
        .bind(rel)
        .bind(rel)
        .bind(size)
        .bind(checksum)
        .fetch_one(service.store.pool())
        .await
        .unwrap()
        .try_get("id")
        .unwrap()
    }

    async fn insert_remote(service: &DuplicateService, remote_id: i64, checksum: &str) {
        sqlx::query(
            "INSERT INTO files (name, size, checksum, source_device_id, remote_file_id) \
             VALUES ('remote', 10, ?, 'dev-1', ?)",
        )
        .bind(checksum)
        .bind(remote_id)
        .execute(service.store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn groups_order_by_savings_and_sum_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let service = fixture(dir.path()).await;
        // group A: 3 copies of 100 bytes -> savings 200
        for i in 0..3 {
            insert_local(&service, &format!("a{i}"), 100, "sha256:aa").await;
        }
        // group B: 2 copies of 500 bytes -> savings 500
        for i in 0..2 {
            insert_local(&service, &format!("b{i}"), 500, "sha256:bb").await;
        }
        let groups = service.find_duplicates().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].checksum, "sha256:bb");
        assert_eq!(groups[0].potential_savings, 500);
        assert_eq!(groups[1].potential_savings, 200);
        for group in &groups {
            let copies_total: i64 = group.local_copies.iter().map(|f| f.size).sum();
            assert_eq!(copies_total - group.file_size, group.potential_savings);
        }
        let stats = service.get_stats().await.unwrap();
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.duplicate_files, 3);
        assert_eq!(stats.wasted_bytes, 700);
    }

    #[tokio::test]
    async fn backup_status_considers_remote_copies() {
        let dir = tempfile::tempdir().unwrap();
        let service = fixture(dir.path()).await;
        insert_local(&service, "photo.jpg", 100, "sha256:cc").await;
        insert_local(&service, "orphan.jpg", 100, "sha256:dd").await;
        insert_remote(&service, 1, "sha256:cc").await;
        let unbacked = service.find_files_without_backup().await.unwrap();
        assert_eq!(unbacked.len(), 1);
        assert_eq!(unbacked[0].name, "orphan.jpg");
    }

    #[tokio::test]
    async fn keep_only_one_deletes_losers_on_disk_and_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let service = fixture(dir.path()).await;
        for name in ["one.bin", "two.bin", "three.bin"] {
            std::fs::File::create(dir.path().join(name))
                .unwrap()
                .write_all(b"same-bytes")
                .unwrap();
        }
        let keep = insert_local(&service, "one.bin", 10, "sha256:ee").await;
        insert_local(&service, "two.bin", 10, "sha256:ee").await;
        insert_local(&service, "three.bin", 10, "sha256:ee").await;
        let removed = service.keep_only_one("sha256:ee", keep).await.unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("one.bin").exists());
        assert!(!dir.path().join("two.bin").exists());
        assert!(!dir.path().join("three.bin").exists());
        let rows = sqlx::query("SELECT id FROM files WHERE source_device_id IS NULL")
            .fetch_all(service.store.pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(service.find_duplicates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keeper_must_belong_to_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let service = fixture(dir.path()).await;
        insert_local(&service, "x", 10, "sha256:ff").await;
        insert_local(&service, "y", 10, "sha256:ff").await;
        let err = service.keep_only_one("sha256:ff", 999).await.unwrap_err();
        assert!(matches!(err, ErrorKind::NotFound));
    }
}
