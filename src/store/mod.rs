use crate::errors::ErrorKind;
use anyhow::Context;
use rand::Rng;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Handle over the embedded relational store. WAL journal, foreign keys on,
/// migrations applied at open. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(dir: &Path) -> anyhow::Result<Store> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {dir:?}"))?;
        }
        let path = dir.join("hearthvault.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to SQLite database: {}", path.display()))?;
        MIGRATOR
            .run(&pool)
            .await
            .with_context(|| "Failed to apply store migrations")?;
        Ok(Store { pool })
    }

    /// A single-connection in-memory store; more than one connection would
    /// each see its own empty database.
    #[cfg(test)]
    pub async fn open_in_memory() -> anyhow::Result<Store> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Store { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, ErrorKind> {
        Ok(self.pool.begin().await?)
    }

    /// Re-run `op` on transient SQLITE_BUSY failures with jittered backoff.
    /// Everything else surfaces immediately.
    pub async fn with_busy_retry<T, F, Fut>(&self, mut op: F) -> Result<T, ErrorKind>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let mapped = ErrorKind::from(err);
                    if matches!(mapped, ErrorKind::Busy) && attempt < 4 {
                        attempt += 1;
                        let jitter = rand::rng().random_range(0..25u64);
                        let backoff = Duration::from_millis((20 << attempt) + jitter);
                        tracing::debug!("store busy, retrying in {:?}", backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(mapped);
                }
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn migrations_create_schema() {
        let store = Store::open_in_memory().await.unwrap();
        let row = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("value"), "1");
    }

    #[tokio::test]
    async fn fts_rowid_tracks_file_id() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO watched_folders (path, name) VALUES ('/tmp/x', 'x')")
            .execute(store.pool())
            .await
            .unwrap();
        let id = sqlx::query(
            "INSERT INTO files (folder_id, relative_path, name) VALUES (1, 'a/vacation.jpg', 'vacation.jpg') RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get::<i64, _>("id");
        let row = sqlx::query("SELECT rowid FROM files_fts WHERE files_fts MATCH 'vacation*'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("rowid"), id);
    }

    #[tokio::test]
    async fn folder_delete_cascades_to_fts() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO watched_folders (path, name) VALUES ('/tmp/y', 'y')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO files (folder_id, relative_path, name) VALUES (1, 'b.txt', 'b.txt')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM watched_folders WHERE id = 1")
            .execute(store.pool())
            .await
            .unwrap();
        let files = sqlx::query("SELECT id FROM files")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(files.is_empty());
        let fts = sqlx::query("SELECT rowid FROM files_fts WHERE files_fts MATCH 'b'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(fts.is_empty());
    }

    #[tokio::test]
    async fn remote_rows_mirror_into_cloud_fts() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO files (name, relative_path, source_device_id, remote_file_id) \
             VALUES ('remote.pdf', 'docs/remote.pdf', 'dev-1', 10)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let local = sqlx::query("SELECT rowid FROM files_fts WHERE files_fts MATCH 'remote'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(local.is_empty());
        let cloud = sqlx::query("SELECT rowid FROM cloud_files_fts WHERE cloud_files_fts MATCH 'remote'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(cloud.len(), 1);
    }
}
