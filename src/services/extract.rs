use crate::errors::{ErrorKind, Result};
use crate::store::Store;
use sqlx::Row;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Pluggable plain-text extraction, keyed by mime. Extractors work on an
/// already-capped byte slice; anything they cannot handle is a no-op.
pub trait TextExtractor: Send + Sync {
    fn supports(&self, mime: &str) -> bool;
    fn extract(&self, bytes: &[u8]) -> Option<String>;
}

/// UTF-8 text family. Invalid trailing bytes (a cut multi-byte sequence at
/// the cap boundary) are trimmed rather than rejected.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn supports(&self, mime: &str) -> bool {
        mime.starts_with("text/") || matches!(mime, "application/json" | "application/xml")
    }

    fn extract(&self, bytes: &[u8]) -> Option<String> {
        match simdutf8::compat::from_utf8(bytes) {
            Ok(text) => Some(text.to_string()),
            Err(err) => {
                let valid = err.valid_up_to();
                if valid == 0 {
                    return None;
                }
                simdutf8::basic::from_utf8(&bytes[..valid])
                    .ok()
                    .map(|it| it.to_string())
            }
        }
    }
}

/// Fills `files_fts.extracted_text` for document rows. A background loop
/// drains a queue fed by the scanner, one file at a time, and yields while a
/// scan holds the gate.
pub struct ExtractService {
    store: Store,
    extractors: Vec<Box<dyn TextExtractor>>,
    max_text_size: usize,
    scan_gate: Arc<Mutex<()>>,
    queue_rx: StdMutex<Option<mpsc::UnboundedReceiver<i64>>>,
    loop_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExtractService {
    pub fn new(
        store: Store,
        max_text_size: usize,
        scan_gate: Arc<Mutex<()>>,
        queue_rx: mpsc::UnboundedReceiver<i64>,
    ) -> Self {
        Self {
            store,
            extractors: vec![Box::new(PlainTextExtractor)],
            max_text_size,
            scan_gate,
            queue_rx: StdMutex::new(Some(queue_rx)),
            loop_task: StdMutex::new(None),
        }
    }

    /// Additional extractors slot in before the service is shared.
    pub fn with_extractor(mut self, extractor: Box<dyn TextExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Extract into the FTS row. Unknown mime types and unreadable files are
    /// no-ops, matching the scanner's per-file error policy.
    pub async fn extract_text(&self, file_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT f.mimetype, f.relative_path, w.path AS folder_path \
             FROM files f JOIN watched_folders w ON w.id = f.folder_id \
             WHERE f.id = ? AND f.source_device_id IS NULL",
        )
        .bind(file_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or(ErrorKind::NotFound)?;
        let mime: String = row.try_get("mimetype")?;
        let extractor = match self.extractors.iter().find(|it| it.supports(&mime)) {
            Some(extractor) => extractor,
            None => return Ok(false),
        };
        let full = PathBuf::from(row.try_get::<String, _>("folder_path")?)
            .join(row.try_get::<String, _>("relative_path")?);
        let bytes = match read_capped(&full, self.max_text_size).await {
            Some(bytes) => bytes,
            None => {
                tracing::warn!("file vanished before text extraction: {:?}", full);
                return Ok(false);
            }
        };
        let text = match extractor.extract(&bytes) {
            Some(text) => text,
            None => return Ok(false),
        };
        sqlx::query("UPDATE files_fts SET extracted_text = ? WHERE rowid = ?")
            .bind(&text)
            .bind(file_id)
            .execute(self.store.pool())
            .await?;
        tracing::debug!("extracted {} bytes of text for file {file_id}", text.len());
        Ok(true)
    }

    /// Start the content-indexer loop. Idempotent; `stop()` or cancelling the
    /// token ends it.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mut slot = self.loop_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let mut queue = match self.queue_rx.lock().unwrap().take() {
            Some(queue) => queue,
            None => return,
        };
        let service = self.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                let file_id = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = queue.recv() => match item {
                        Some(id) => id,
                        None => break,
                    },
                };
                // one item at a time; the gate stays held until the item is
                // done so extraction never overlaps a scan
                let _gate = loop {
                    if let Ok(guard) = service.scan_gate.try_lock() {
                        break guard;
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                };
                if let Err(err) = service.extract_text(file_id).await {
                    tracing::warn!(reason = %err, "text extraction failed for file {file_id}");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Queue every document row whose FTS text is still empty. Run once at
    /// engine start so work survives restarts.
    pub async fn backfill(&self, tx: &mpsc::UnboundedSender<i64>) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT f.id FROM files f \
             JOIN files_fts ft ON ft.rowid = f.id \
             WHERE f.source_device_id IS NULL AND f.content_type = 4 \
             AND ft.extracted_text = ''",
        )
        .fetch_all(self.store.pool())
        .await?;
        let mut queued = 0;
        for row in rows {
            if tx.send(row.try_get("id")?).is_ok() {
                queued += 1;
            }
        }
        Ok(queued)
    }
}

async fn read_capped(path: &std::path::Path, cap: usize) -> Option<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; cap];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    buf.truncate(filled);
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Visibility;
    use crate::services::events::EventBus;
    use crate::services::index::IndexService;
    use crate::services::scanner::ScanService;
    use std::io::Write;

    #[test]
    fn plain_text_extractor_trims_cut_sequences() {
        let extractor = PlainTextExtractor;
        assert_eq!(extractor.extract(b"hello").as_deref(), Some("hello"));
        // 4-byte emoji cut in half at the cap boundary
        let mut bytes = b"ok ".to_vec();
        bytes.extend_from_slice(&"🦀".as_bytes()[..2]);
        assert_eq!(extractor.extract(&bytes).as_deref(), Some("ok "));
        assert!(extractor.supports("text/markdown"));
        assert!(!extractor.supports("application/pdf"));
    }

    #[tokio::test]
    async fn extract_updates_fts_and_search_finds_it() {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventBus::new());
        let gate = Arc::new(Mutex::new(()));
        let (tx, rx) = mpsc::unbounded_channel();
        let index = IndexService::new(store.clone(), events.clone());
        let scanner = ScanService::new(store.clone(), events, gate.clone(), tx.clone());
        let extract = ExtractService::new(store.clone(), 64 * 1024, gate, rx);

        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("trip.txt"))
            .unwrap()
            .write_all(b"our summer vacation in the alps")
            .unwrap();
        let folder_id = index
            .add_folder(dir.path(), None, Visibility::Family)
            .await
            .unwrap();
        scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        let file_id: i64 = sqlx::query("SELECT id FROM files WHERE name = 'trip.txt'")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .try_get("id")
            .unwrap();
        assert!(extract.extract_text(file_id).await.unwrap());
        let hits = sqlx::query("SELECT rowid FROM files_fts WHERE files_fts MATCH 'vacation'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].try_get::<i64, _>("rowid").unwrap(), file_id);
    }
}
