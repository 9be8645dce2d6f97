use crate::errors::{ErrorKind, Result};
use crate::models::{ContentType, Timestamp, Visibility};
use crate::services::checksum::compute_checksum;
use crate::services::events::{EngineEvent, EventBus, ScanProgressPayload};
use crate::store::Store;
use crate::utils;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub folder_id: i64,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    /// Set when per-file errors occurred but the scan itself completed.
    pub partial: bool,
}

/// Walks watched folders and keeps their file rows current. Scans are fully
/// serialized through `scan_gate`; the content indexer polls the same gate to
/// stay out of the way.
pub struct ScanService {
    store: Store,
    events: Arc<EventBus>,
    scan_gate: Arc<Mutex<()>>,
    extract_tx: mpsc::UnboundedSender<i64>,
}

impl ScanService {
    pub fn new(
        store: Store,
        events: Arc<EventBus>,
        scan_gate: Arc<Mutex<()>>,
        extract_tx: mpsc::UnboundedSender<i64>,
    ) -> Self {
        Self {
            store,
            events,
            scan_gate,
            extract_tx,
        }
    }

    pub async fn scan_folder(&self, folder_id: i64, cancel: CancellationToken) -> Result<ScanOutcome> {
        let _guard = self.scan_gate.try_lock().map_err(|_| ErrorKind::Busy)?;
        self.scan_locked(folder_id, &cancel).await
    }

    /// Scan every enabled folder sequentially under one gate acquisition.
    pub async fn scan_all(&self, cancel: CancellationToken) -> Result<Vec<ScanOutcome>> {
        let _guard = self.scan_gate.try_lock().map_err(|_| ErrorKind::Busy)?;
        let rows = sqlx::query("SELECT id FROM watched_folders WHERE enabled = 1 ORDER BY id")
            .fetch_all(self.store.pool())
            .await?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            outcomes.push(self.scan_locked(id, &cancel).await?);
        }
        Ok(outcomes)
    }

    async fn scan_locked(&self, folder_id: i64, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let folder = sqlx::query("SELECT path, visibility FROM watched_folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(ErrorKind::NotFound)?;
        let root = PathBuf::from(folder.try_get::<String, _>("path")?);
        let visibility = Visibility::from_i64(folder.try_get("visibility")?);

        tracing::info!(target: "event", "scan started [folder={folder_id}] [path={:?}]", root);
        let mut outcome = ScanOutcome {
            folder_id,
            ..Default::default()
        };
        let entries = self.walk(&root, &mut outcome).await?;
        outcome.total = entries.len() as u64;

        let mut seen = HashSet::with_capacity(entries.len());
        let mut total_size: i64 = 0;
        let mut last_emit = Instant::now() - PROGRESS_INTERVAL;
        for (path, len, modified, created) in entries {
            if cancel.is_cancelled() {
                tracing::warn!("scan aborted [folder={folder_id}]");
                return Err(ErrorKind::Cancelled);
            }
            let relative = match path.strip_prefix(&root) {
                Ok(rel) => rel.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                last_emit = Instant::now();
                self.events.send(EngineEvent::ScanProgress(ScanProgressPayload {
                    folder_id,
                    total: outcome.total,
                    processed: outcome.processed,
                    current_file: Some(relative.clone()),
                }));
            }
            match self
                .upsert_file(folder_id, visibility, &path, &relative, len, modified, created)
                .await
            {
                Ok(()) => {
                    outcome.processed += 1;
                    total_size += len as i64;
                    seen.insert(relative);
                }
                Err(err) => {
                    outcome.errors += 1;
                    tracing::warn!(reason = %err, "failed to index file {:?}", path);
                }
            }
        }

        self.prune_vanished(folder_id, &seen).await?;

        sqlx::query(
            "UPDATE watched_folders SET last_scan_at = ?, file_count = ?, total_size = ? WHERE id = ?",
        )
        .bind(Timestamp::now().millis())
        .bind(seen.len() as i64)
        .bind(total_size)
        .bind(folder_id)
        .execute(self.store.pool())
        .await?;

        outcome.partial = outcome.errors > 0;
        self.events.send(EngineEvent::ScanProgress(ScanProgressPayload {
            folder_id,
            total: outcome.total,
            processed: outcome.processed,
            current_file: None,
        }));
        self.events.send(EngineEvent::IndexChanged);
        tracing::info!(
            target: "event",
            "scan finished [folder={folder_id}] [processed={}] [errors={}]",
            outcome.processed,
            outcome.errors
        );
        Ok(outcome)
    }

    /// Iterative descent; symlinks are skipped, unreadable directories count
    /// as errors without aborting the scan.
    async fn walk(
        &self,
        root: &Path,
        outcome: &mut ScanOutcome,
    ) -> Result<Vec<(PathBuf, u64, i64, Option<i64>)>> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    if dir == root {
                        return Err(err.into());
                    }
                    outcome.errors += 1;
                    tracing::warn!(reason = %err, "failed to read directory {:?}", dir);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::from)? {
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(err) => {
                        outcome.errors += 1;
                        tracing::warn!(reason = %err, "failed to stat {:?}", entry.path());
                        continue;
                    }
                };
                let modified = metadata
                    .modified()
                    .map(Timestamp::from_system_time)
                    .map(|t| t.millis())
                    .unwrap_or_default();
                let created = metadata
                    .created()
                    .ok()
                    .map(Timestamp::from_system_time)
                    .map(|t| t.millis());
                files.push((entry.path(), metadata.len(), modified, created));
            }
        }
        Ok(files)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_file(
        &self,
        folder_id: i64,
        visibility: Visibility,
        path: &Path,
        relative: &str,
        len: u64,
        modified: i64,
        created: Option<i64>,
    ) -> Result<()> {
        let name = path
            .file_name()
            .map(|it| it.to_string_lossy().to_string())
            .unwrap_or_else(|| relative.to_string());
        let extension = path
            .extension()
            .map(|it| it.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let now = Timestamp::now().millis();

        let existing = sqlx::query(
            "SELECT id, size, modified_at FROM files \
             WHERE folder_id = ? AND relative_path = ? AND source_device_id IS NULL",
        )
        .bind(folder_id)
        .bind(relative)
        .fetch_optional(self.store.pool())
        .await?;

        match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let old_size: i64 = row.try_get("size")?;
                let old_modified: i64 = row.try_get("modified_at")?;
                if old_size == len as i64 && old_modified == modified {
                    self.store
                        .with_busy_retry(|| {
                            sqlx::query("UPDATE files SET indexed_at = ? WHERE id = ?")
                                .bind(now)
                                .bind(id)
                                .execute(self.store.pool())
                        })
                        .await?;
                    return Ok(());
                }
                let (mime, content_type) = utils::classify_path(path, &extension).await;
                self.store
                    .with_busy_retry(|| {
                        sqlx::query(
                            "UPDATE files SET size = ?, modified_at = ?, mimetype = ?, \
                             content_type = ?, checksum = NULL, indexed_at = ?, \
                             sync_version = sync_version + 1 WHERE id = ?",
                        )
                        .bind(len as i64)
                        .bind(modified)
                        .bind(&mime)
                        .bind(content_type.as_i64())
                        .bind(now)
                        .bind(id)
                        .execute(self.store.pool())
                    })
                    .await?;
                self.post_index(id, path, content_type).await;
            }
            None => {
                let (mime, content_type) = utils::classify_path(path, &extension).await;
                let result = self
                    .store
                    .with_busy_retry(|| {
                        sqlx::query(
                            "INSERT INTO files (folder_id, relative_path, name, extension, size, \
                             mimetype, content_type, created_at, modified_at, indexed_at, \
                             visibility, sync_version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                        )
                        .bind(folder_id)
                        .bind(relative)
                        .bind(&name)
                        .bind(&extension)
                        .bind(len as i64)
                        .bind(&mime)
                        .bind(content_type.as_i64())
                        .bind(created)
                        .bind(modified)
                        .bind(now)
                        .bind(visibility.as_i64())
                        .execute(self.store.pool())
                    })
                    .await?;
                let id = result.last_insert_rowid();
                self.post_index(id, path, content_type).await;
            }
        }
        Ok(())
    }

    /// Follow-up work that must not fail the scan: image dimensions and the
    /// extraction queue.
    async fn post_index(&self, file_id: i64, path: &Path, content_type: ContentType) {
        match content_type {
            ContentType::Image => {
                if let Some((width, height)) = probe_image_dimensions(path).await {
                    let result = sqlx::query(
                        "INSERT OR REPLACE INTO image_metadata (file_id, width, height) \
                         VALUES (?, ?, ?)",
                    )
                    .bind(file_id)
                    .bind(width as i64)
                    .bind(height as i64)
                    .execute(self.store.pool())
                    .await;
                    if let Err(err) = result {
                        tracing::warn!(reason = %err, "failed to store image metadata");
                    }
                }
            }
            ContentType::Document => {
                let _ = self.extract_tx.send(file_id);
            }
            _ => {}
        }
    }

    async fn prune_vanished(&self, folder_id: i64, seen: &HashSet<String>) -> Result<()> {
        let rows = sqlx::query(
            "SELECT id, relative_path FROM files \
             WHERE folder_id = ? AND source_device_id IS NULL",
        )
        .bind(folder_id)
        .fetch_all(self.store.pool())
        .await?;
        let now = Timestamp::now().millis();
        for row in rows {
            let relative: String = row.try_get("relative_path")?;
            if seen.contains(&relative) {
                continue;
            }
            let id: i64 = row.try_get("id")?;
            let mut tx = self.store.begin().await?;
            sqlx::query("INSERT OR REPLACE INTO tombstones (file_id, deleted_at) VALUES (?, ?)")
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Backfill checksums for local rows that do not have one yet. Files that
    /// vanished between listing and read are logged and skipped.
    pub async fn compute_missing_checksums(&self, cancel: CancellationToken) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT f.id, f.folder_id, f.relative_path, w.path AS folder_path \
             FROM files f JOIN watched_folders w ON w.id = f.folder_id \
             WHERE f.checksum IS NULL AND f.source_device_id IS NULL",
        )
        .fetch_all(self.store.pool())
        .await?;
        let total = rows.len() as u64;
        let mut done: u64 = 0;
        let mut folder_cache: HashMap<i64, PathBuf> = HashMap::new();
        for row in rows {
            if cancel.is_cancelled() {
                return Err(ErrorKind::Cancelled);
            }
            let id: i64 = row.try_get("id")?;
            let folder_id: i64 = row.try_get("folder_id")?;
            let relative: String = row.try_get("relative_path")?;
            let folder_path = folder_cache
                .entry(folder_id)
                .or_insert_with(|| PathBuf::from(row.try_get::<String, _>("folder_path").unwrap_or_default()))
                .clone();
            let full = folder_path.join(&relative);
            match compute_checksum(&full).await {
                Ok(checksum) => {
                    self.store
                        .with_busy_retry(|| {
                            sqlx::query("UPDATE files SET checksum = ? WHERE id = ?")
                                .bind(&checksum)
                                .bind(id)
                                .execute(self.store.pool())
                        })
                        .await?;
                    done += 1;
                }
                Err(ErrorKind::NotFound) => {
                    tracing::warn!("file vanished before checksum: {:?}", full);
                }
                Err(err) => {
                    tracing::warn!(reason = %err, "checksum failed for {:?}", full);
                }
            }
            self.events.send(EngineEvent::ScanProgress(ScanProgressPayload {
                folder_id,
                total,
                processed: done,
                current_file: Some(relative),
            }));
        }
        Ok(done)
    }
}

/// Header-only dimension probe for PNG/GIF/BMP/JPEG. Anything else is left
/// without an image_metadata row.
pub async fn probe_image_dimensions(path: &Path) -> Option<(u32, u32)> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    buf.truncate(filled);
    probe_dimensions_in(&buf)
}

fn probe_dimensions_in(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() >= 24 && buf.starts_with(&[0x89, b'P', b'N', b'G']) {
        let width = u32::from_be_bytes(buf[16..20].try_into().ok()?);
        let height = u32::from_be_bytes(buf[20..24].try_into().ok()?);
        return Some((width, height));
    }
    if buf.len() >= 10 && buf.starts_with(b"GIF8") {
        let width = u16::from_le_bytes([buf[6], buf[7]]) as u32;
        let height = u16::from_le_bytes([buf[8], buf[9]]) as u32;
        return Some((width, height));
    }
    if buf.len() >= 26 && buf.starts_with(b"BM") {
        let width = i32::from_le_bytes(buf[18..22].try_into().ok()?).unsigned_abs();
        let height = i32::from_le_bytes(buf[22..26].try_into().ok()?).unsigned_abs();
        return Some((width, height));
    }
    if buf.len() >= 4 && buf.starts_with(&[0xFF, 0xD8]) {
        // walk JPEG segments looking for a start-of-frame marker
        let mut i = 2;
        while i + 9 < buf.len() {
            if buf[i] != 0xFF {
                return None;
            }
            let marker = buf[i + 1];
            if matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
                let height = u16::from_be_bytes([buf[i + 5], buf[i + 6]]) as u32;
                let width = u16::from_be_bytes([buf[i + 7], buf[i + 8]]) as u32;
                return Some((width, height));
            }
            let seg_len = u16::from_be_bytes([buf[i + 2], buf[i + 3]]) as usize;
            i += 2 + seg_len;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentType;
    use std::io::Write;

    fn write_file(dir: &Path, rel: &str, bytes: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::File::create(path).unwrap().write_all(bytes).unwrap();
    }

    async fn fixture() -> (ScanService, crate::services::index::IndexService, tempfile::TempDir) {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventBus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let scanner = ScanService::new(store.clone(), events.clone(), Arc::new(Mutex::new(())), tx);
        let index = crate::services::index::IndexService::new(store, events);
        (scanner, index, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn scan_indexes_and_classifies() {
        let (scanner, index, dir) = fixture().await;
        write_file(dir.path(), "a.jpg", &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]);
        write_file(dir.path(), "notes.txt", b"plain old notes");
        write_file(dir.path(), "a.jpg.bak", &[0x01, 0x02, 0x03, 0x04]);
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Family)
            .await
            .unwrap();
        let outcome = scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.processed, 3);
        assert!(!outcome.partial);
        let stats = index.get_stats().await.unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.image, 1);
        assert_eq!(stats.document, 1);
        assert_eq!(stats.other, 1);
        let recent = index.get_recent(10).await.unwrap();
        let bak = recent.iter().find(|f| f.name == "a.jpg.bak").unwrap();
        assert_eq!(bak.content_type, ContentType::Other);
        assert_eq!(bak.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn rescan_prunes_vanished_files_with_tombstones() {
        let (scanner, index, dir) = fixture().await;
        write_file(dir.path(), "keep.txt", b"keep");
        write_file(dir.path(), "drop.txt", b"drop");
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Family)
            .await
            .unwrap();
        scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("drop.txt")).unwrap();
        let outcome = scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.processed, 1);
        let stats = index.get_stats().await.unwrap();
        assert_eq!(stats.total_files, 1);
        let tombs = sqlx::query("SELECT file_id FROM tombstones")
            .fetch_all(scanner.store.pool())
            .await
            .unwrap();
        assert_eq!(tombs.len(), 1);
    }

    #[tokio::test]
    async fn checksum_backfill_fills_null_rows() {
        let (scanner, index, dir) = fixture().await;
        write_file(dir.path(), "data.bin", b"hello world");
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Family)
            .await
            .unwrap();
        scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        let filled = scanner
            .compute_missing_checksums(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(filled, 1);
        let row = sqlx::query("SELECT checksum FROM files WHERE name = 'data.bin'")
            .fetch_one(scanner.store.pool())
            .await
            .unwrap();
        assert_eq!(
            row.try_get::<String, _>("checksum").unwrap(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn concurrent_scan_is_busy() {
        let (scanner, index, dir) = fixture().await;
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Private)
            .await
            .unwrap();
        let _held = scanner.scan_gate.clone().try_lock_owned().unwrap();
        let err = scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Busy));
    }

    #[tokio::test]
    async fn image_dimensions_are_probed_into_metadata() {
        let (scanner, index, dir) = fixture().await;
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&320u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        write_file(dir.path(), "anim.gif", &gif);
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Private)
            .await
            .unwrap();
        scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        let file = &index.get_recent(1).await.unwrap()[0];
        let metadata = index.get_image_metadata(file.id).await.unwrap().unwrap();
        assert_eq!(metadata.width, Some(320));
        assert_eq!(metadata.height, Some(200));
        assert!(metadata.taken_at.is_none());
    }

    #[test]
    fn png_and_gif_dimension_probe() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        assert_eq!(probe_dimensions_in(&png), Some((640, 480)));

        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&320u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        assert_eq!(probe_dimensions_in(&gif), Some((320, 200)));

        assert_eq!(probe_dimensions_in(b"not an image"), None);
    }
}
