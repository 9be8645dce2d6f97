use crate::errors::{ErrorKind, Result};
use crate::models::{FileRecord, Timestamp};
use crate::protocol::{
    IndexDeltaAckPayload, IndexDeltaPayload, IndexSyncRequestPayload, IndexSyncResponsePayload,
    Message, MessageType, new_request_id,
};
use crate::services::events::{EngineEvent, EventBus};
use crate::services::session::SessionService;
use crate::store::Store;
use crate::utils::content_type_for_mime;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Flow control: the receiver acks every K applied deltas, the sender waits
/// for one ack per K sent.
const ACK_EVERY: usize = 32;
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exchanges index deltas with trusted peers and owns every file row whose
/// `source_device_id` is not null.
pub struct SyncService {
    store: Store,
    sessions: Arc<SessionService>,
    events: Arc<EventBus>,
    max_text_size_kb: u32,
}

impl SyncService {
    pub fn new(
        store: Store,
        sessions: Arc<SessionService>,
        events: Arc<EventBus>,
        max_text_size_kb: u32,
    ) -> Self {
        Self {
            store,
            sessions,
            events,
            max_text_size_kb,
        }
    }

    /// Kick off a sync toward every peer as it connects.
    pub fn setup_index_sync(self: &Arc<Self>, cancel: CancellationToken) {
        let service = self.clone();
        let mut receiver = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                };
                if let EngineEvent::DeviceConnected(device_id) = event {
                    let service = service.clone();
                    tokio::spawn(async move {
                        match service.request_sync(&device_id).await {
                            Ok(applied) => {
                                tracing::info!(target: "event", "sync finished [peer={device_id}] [applied={applied}]");
                            }
                            Err(err) => {
                                tracing::warn!(reason = %err, "sync with {device_id} failed");
                            }
                        }
                    });
                }
            }
        });
    }

    /// Pull everything the peer changed since our per-peer cursor.
    pub async fn request_sync(&self, device_id: &str) -> Result<u64> {
        let since: i64 = sqlx::query("SELECT last_sync_at FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(self.store.pool())
            .await?
            .map(|row| row.try_get("last_sync_at"))
            .transpose()?
            .unwrap_or(0);
        let request = Message::json(
            MessageType::IndexSyncRequest,
            new_request_id(),
            &IndexSyncRequestPayload {
                since_timestamp: since,
                folder_ids: None,
                max_text_size_kb: self.max_text_size_kb,
            },
        )?;
        let (request_id, mut rx) = self.sessions.open_stream(device_id, request, 64).await?;
        let result = self
            .drain_delta_stream(device_id, &request_id, &mut rx)
            .await;
        self.sessions.close_stream(device_id, &request_id);
        let (applied, cursor) = result?;
        if let Some(cursor) = cursor {
            sqlx::query(
                "UPDATE devices SET last_sync_at = ? WHERE device_id = ? AND last_sync_at < ?",
            )
            .bind(cursor)
            .bind(device_id)
            .bind(cursor)
            .execute(self.store.pool())
            .await?;
        }
        if applied > 0 {
            self.events.send(EngineEvent::IndexChanged);
        }
        Ok(applied)
    }

    async fn drain_delta_stream(
        &self,
        device_id: &str,
        request_id: &str,
        rx: &mut tokio::sync::mpsc::Receiver<Message>,
    ) -> Result<(u64, Option<i64>)> {
        let first = tokio::time::timeout(STREAM_IDLE_TIMEOUT, rx.recv())
            .await
            .map_err(|_| ErrorKind::Timeout)?
            .ok_or(ErrorKind::PeerDisconnected)?;
        if first.kind != MessageType::IndexSyncResponse {
            return Err(ErrorKind::ProtocolError("expected IndexSyncResponse".to_string()));
        }
        let header: IndexSyncResponsePayload = first.parse_json()?;
        let expected = header.delta_count.max(0) as u64;

        let mut received: u64 = 0;
        let mut applied: u64 = 0;
        let mut cursor: Option<i64> = None;
        let mut unacked: Vec<i64> = Vec::new();
        while received < expected {
            let frame = tokio::time::timeout(STREAM_IDLE_TIMEOUT, rx.recv())
                .await
                .map_err(|_| ErrorKind::Timeout)?
                .ok_or(ErrorKind::PeerDisconnected)?;
            if frame.kind != MessageType::IndexDelta {
                return Err(ErrorKind::ProtocolError("expected IndexDelta".to_string()));
            }
            let delta: IndexDeltaPayload = frame.parse_json()?;
            received += 1;
            cursor = Some(cursor.unwrap_or(0).max(delta.sync_timestamp));
            if apply_delta(&self.store, device_id, &delta, self.max_text_size_kb).await? {
                applied += 1;
            }
            unacked.push(delta.file_id);
            if unacked.len() >= ACK_EVERY {
                self.ack(device_id, request_id, &mut unacked).await?;
            }
        }
        if !unacked.is_empty() {
            self.ack(device_id, request_id, &mut unacked).await?;
        }
        Ok((applied, cursor))
    }

    async fn ack(&self, device_id: &str, request_id: &str, batch: &mut Vec<i64>) -> Result<()> {
        let ack = Message::json(
            MessageType::IndexDeltaAck,
            request_id.to_string(),
            &IndexDeltaAckPayload {
                file_ids: std::mem::take(batch),
            },
        )?;
        self.sessions.send(device_id, ack).await
    }

    /// Responder side: stream deltas for everything family-visible that
    /// changed since the requester's cursor.
    pub async fn handle_sync_request(
        &self,
        device_id: &str,
        request_id: &str,
        payload: IndexSyncRequestPayload,
    ) -> Result<()> {
        let text_cap_kb = payload.max_text_size_kb.min(self.max_text_size_kb);
        let deltas = collect_deltas(
            &self.store,
            payload.since_timestamp,
            payload.folder_ids.as_deref(),
            text_cap_kb,
        )
        .await?;
        let mut acks = self.sessions.register_stream(device_id, request_id, 16)?;
        let result = async {
            let header = Message::json(
                MessageType::IndexSyncResponse,
                request_id.to_string(),
                &IndexSyncResponsePayload {
                    delta_count: deltas.len() as i64,
                },
            )?;
            self.sessions.send(device_id, header).await?;
            let mut since_ack = 0usize;
            for delta in &deltas {
                let frame =
                    Message::json(MessageType::IndexDelta, request_id.to_string(), delta)?;
                self.sessions.send(device_id, frame).await?;
                since_ack += 1;
                if since_ack >= ACK_EVERY {
                    // wait for the receiver before the next window
                    let frame = tokio::time::timeout(STREAM_IDLE_TIMEOUT, acks.recv())
                        .await
                        .map_err(|_| ErrorKind::Timeout)?
                        .ok_or(ErrorKind::PeerDisconnected)?;
                    if frame.kind != MessageType::IndexDeltaAck {
                        return Err(ErrorKind::ProtocolError("expected IndexDeltaAck".to_string()));
                    }
                    since_ack = 0;
                }
            }
            Ok(())
        }
        .await;
        self.sessions.close_stream(device_id, request_id);
        tracing::debug!(
            "served sync request from {device_id}: {} deltas since {}",
            deltas.len(),
            payload.since_timestamp
        );
        result
    }

    pub async fn get_remote_files(&self, device_id: Option<&str>) -> Result<Vec<FileRecord>> {
        let mut sql = format!(
            "SELECT {} FROM files WHERE source_device_id IS NOT NULL",
            FileRecord::COLUMNS
        );
        let rows = match device_id {
            Some(device_id) => {
                sql.push_str(" AND source_device_id = ? ORDER BY modified_at DESC");
                sqlx::query(&sql)
                    .bind(device_id)
                    .fetch_all(self.store.pool())
                    .await?
            }
            None => {
                sql.push_str(" ORDER BY modified_at DESC");
                sqlx::query(&sql).fetch_all(self.store.pool()).await?
            }
        };
        let mut files = Vec::with_capacity(rows.len());
        for row in &rows {
            files.push(FileRecord::from_row(row)?);
        }
        Ok(files)
    }

    pub async fn get_remote_file_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM files WHERE source_device_id IS NOT NULL")
            .fetch_one(self.store.pool())
            .await?;
        Ok(row.try_get("c")?)
    }
}

/// Upserts and tombstones for every Family-visible local change after
/// `since`, ready to put on the wire.
pub(crate) async fn collect_deltas(
    store: &Store,
    since: i64,
    folder_ids: Option<&[i64]>,
    text_cap_kb: u32,
) -> Result<Vec<IndexDeltaPayload>> {
    let own_device: String = sqlx::query("SELECT value FROM meta WHERE key = 'device_id'")
        .fetch_optional(store.pool())
        .await?
        .map(|row| row.try_get("value"))
        .transpose()?
        .unwrap_or_default();
    let mut sql = String::from(
        "SELECT f.id, f.relative_path, f.name, f.mimetype, f.size, f.modified_at, f.checksum, \
         f.sync_version, ft.extracted_text \
         FROM files f LEFT JOIN files_fts ft ON ft.rowid = f.id \
         WHERE f.source_device_id IS NULL AND f.visibility = 1 AND f.modified_at > ?",
    );
    if let Some(ids) = folder_ids {
        if !ids.is_empty() {
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND f.folder_id IN ({placeholders})"));
        }
    }
    let mut query = sqlx::query(&sql).bind(since);
    if let Some(ids) = folder_ids {
        for id in ids {
            query = query.bind(id);
        }
    }
    let rows = query.fetch_all(store.pool()).await?;
    let now = Timestamp::now().millis();
    let text_cap = text_cap_kb as usize * 1024;
    let mut deltas = Vec::with_capacity(rows.len());
    for row in rows {
        let mut extracted: Option<String> = row.try_get("extracted_text")?;
        if let Some(text) = &extracted {
            if text.is_empty() {
                extracted = None;
            } else if text.len() > text_cap {
                let mut cut = text_cap;
                while cut > 0 && !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                extracted = Some(text[..cut].to_string());
            }
        }
        deltas.push(IndexDeltaPayload {
            file_id: row.try_get("id")?,
            path: row.try_get::<Option<String>, _>("relative_path")?.unwrap_or_default(),
            name: row.try_get("name")?,
            mime_type: row.try_get("mimetype")?,
            size: row.try_get("size")?,
            modified_at: row.try_get("modified_at")?,
            checksum: row.try_get("checksum")?,
            extracted_text: extracted,
            is_deleted: false,
            device_id: own_device.clone(),
            sync_version: row.try_get("sync_version")?,
            sync_timestamp: now,
        });
    }
    let tombstones = sqlx::query("SELECT file_id, deleted_at FROM tombstones WHERE deleted_at > ?")
        .bind(since)
        .fetch_all(store.pool())
        .await?;
    for row in tombstones {
        deltas.push(IndexDeltaPayload {
            file_id: row.try_get("file_id")?,
            path: String::new(),
            name: String::new(),
            mime_type: String::new(),
            size: 0,
            modified_at: row.try_get("deleted_at")?,
            checksum: None,
            extracted_text: None,
            is_deleted: true,
            device_id: own_device.clone(),
            sync_version: 0,
            sync_timestamp: now,
        });
    }
    Ok(deltas)
}

/// Apply one delta as a device-scoped remote row. Conflicts resolve by
/// highest sync_version, then latest modified_at. Returns false when the
/// existing row wins.
pub(crate) async fn apply_delta(
    store: &Store,
    sender: &str,
    delta: &IndexDeltaPayload,
    max_text_size_kb: u32,
) -> Result<bool> {
    if delta.is_deleted {
        let result = sqlx::query(
            "DELETE FROM files WHERE source_device_id = ? AND remote_file_id = ?",
        )
        .bind(sender)
        .bind(delta.file_id)
        .execute(store.pool())
        .await?;
        return Ok(result.rows_affected() > 0);
    }
    let existing = sqlx::query(
        "SELECT id, sync_version, modified_at FROM files \
         WHERE source_device_id = ? AND remote_file_id = ?",
    )
    .bind(sender)
    .bind(delta.file_id)
    .fetch_optional(store.pool())
    .await?;
    let now = Timestamp::now().millis();
    let extension = delta
        .name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    let content_type = content_type_for_mime(&delta.mime_type).as_i64();
    let row_id = match existing {
        Some(row) => {
            let id: i64 = row.try_get("id")?;
            let version: i64 = row.try_get("sync_version")?;
            let modified: i64 = row.try_get("modified_at")?;
            if version > delta.sync_version
                || (version == delta.sync_version && modified >= delta.modified_at)
            {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE files SET relative_path = ?, name = ?, extension = ?, size = ?, \
                 mimetype = ?, content_type = ?, checksum = ?, modified_at = ?, indexed_at = ?, \
                 sync_version = ?, last_modified_by = ? WHERE id = ?",
            )
            .bind(&delta.path)
            .bind(&delta.name)
            .bind(&extension)
            .bind(delta.size)
            .bind(&delta.mime_type)
            .bind(content_type)
            .bind(&delta.checksum)
            .bind(delta.modified_at)
            .bind(now)
            .bind(delta.sync_version)
            .bind(sender)
            .bind(id)
            .execute(store.pool())
            .await?;
            id
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO files (relative_path, name, extension, size, mimetype, content_type, \
                 checksum, modified_at, indexed_at, visibility, source_device_id, remote_file_id, \
                 sync_version, last_modified_by) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
            )
            .bind(&delta.path)
            .bind(&delta.name)
            .bind(&extension)
            .bind(delta.size)
            .bind(&delta.mime_type)
            .bind(content_type)
            .bind(&delta.checksum)
            .bind(delta.modified_at)
            .bind(now)
            .bind(sender)
            .bind(delta.file_id)
            .bind(delta.sync_version)
            .bind(sender)
            .execute(store.pool())
            .await?;
            result.last_insert_rowid()
        }
    };
    if let Some(text) = &delta.extracted_text {
        let cap = max_text_size_kb as usize * 1024;
        let mut cut = text.len().min(cap);
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        sqlx::query("UPDATE cloud_files_fts SET extracted_text = ? WHERE rowid = ?")
            .bind(&text[..cut])
            .bind(row_id)
            .execute(store.pool())
            .await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(file_id: i64, version: i64, modified: i64) -> IndexDeltaPayload {
        IndexDeltaPayload {
            file_id,
            path: format!("pics/photo_{file_id}.jpg"),
            name: format!("photo_{file_id}.jpg"),
            mime_type: "image/jpeg".into(),
            size: 1000,
            modified_at: modified,
            checksum: Some("sha256:ab".into()),
            extracted_text: None,
            is_deleted: false,
            device_id: "peer-x".into(),
            sync_version: version,
            sync_timestamp: modified + 1,
        }
    }

    #[tokio::test]
    async fn apply_insert_then_conflict_resolution() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(apply_delta(&store, "peer-x", &delta(1, 1, 100), 64).await.unwrap());
        // stale version loses
        assert!(!apply_delta(&store, "peer-x", &delta(1, 1, 50), 64).await.unwrap());
        // higher version wins
        let mut newer = delta(1, 2, 60);
        newer.name = "renamed.jpg".into();
        assert!(apply_delta(&store, "peer-x", &newer, 64).await.unwrap());
        let row = sqlx::query("SELECT name, extension FROM files WHERE source_device_id = 'peer-x'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.try_get::<String, _>("name").unwrap(), "renamed.jpg");
        assert_eq!(row.try_get::<String, _>("extension").unwrap(), "jpg");
        // same device-scoped key stays unique
        let count = sqlx::query("SELECT COUNT(*) AS c FROM files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.try_get::<i64, _>("c").unwrap(), 1);
    }

    #[tokio::test]
    async fn tombstone_removes_remote_row_and_fts_entry() {
        let store = Store::open_in_memory().await.unwrap();
        apply_delta(&store, "peer-x", &delta(5, 1, 100), 64).await.unwrap();
        let mut tomb = delta(5, 2, 200);
        tomb.is_deleted = true;
        assert!(apply_delta(&store, "peer-x", &tomb, 64).await.unwrap());
        let rows = sqlx::query("SELECT id FROM files WHERE source_device_id = 'peer-x'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(rows.is_empty());
        let fts = sqlx::query("SELECT rowid FROM cloud_files_fts WHERE cloud_files_fts MATCH 'photo'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(fts.is_empty());
        // deleting again is a no-op
        assert!(!apply_delta(&store, "peer-x", &tomb, 64).await.unwrap());
    }

    #[tokio::test]
    async fn extracted_text_is_applied_and_searchable() {
        let store = Store::open_in_memory().await.unwrap();
        let mut d = delta(9, 1, 100);
        d.mime_type = "text/plain".into();
        d.name = "trip_notes.txt".into();
        d.extracted_text = Some("skiing vacation itinerary".into());
        apply_delta(&store, "peer-x", &d, 64).await.unwrap();
        let hits = sqlx::query("SELECT rowid FROM cloud_files_fts WHERE cloud_files_fts MATCH 'vacation'")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn collect_deltas_honors_cursor_visibility_and_cap() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO meta (key, value) VALUES ('device_id', 'me-1234')")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO watched_folders (path, name, visibility) VALUES ('/tmp/s', 's', 1)")
            .execute(store.pool())
            .await
            .unwrap();
        // family-visible, changed after cursor
        sqlx::query(
            "INSERT INTO files (folder_id, relative_path, name, visibility, modified_at, sync_version) \
             VALUES (1, 'new.txt', 'new.txt', 1, 200, 3)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        // private row must not leave the device
        sqlx::query(
            "INSERT INTO files (folder_id, relative_path, name, visibility, modified_at) \
             VALUES (1, 'secret.txt', 'secret.txt', 0, 300)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        // unchanged row stays out
        sqlx::query(
            "INSERT INTO files (folder_id, relative_path, name, visibility, modified_at) \
             VALUES (1, 'old.txt', 'old.txt', 1, 50)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query("UPDATE files_fts SET extracted_text = ? WHERE rowid = 1")
            .bind("x".repeat(4096))
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO tombstones (file_id, deleted_at) VALUES (99, 250)")
            .execute(store.pool())
            .await
            .unwrap();

        let deltas = collect_deltas(&store, 100, None, 1).await.unwrap();
        assert_eq!(deltas.len(), 2);
        let upsert = deltas.iter().find(|d| !d.is_deleted).unwrap();
        assert_eq!(upsert.name, "new.txt");
        assert_eq!(upsert.sync_version, 3);
        assert_eq!(upsert.device_id, "me-1234");
        assert_eq!(upsert.extracted_text.as_ref().unwrap().len(), 1024);
        let tomb = deltas.iter().find(|d| d.is_deleted).unwrap();
        assert_eq!(tomb.file_id, 99);
    }
}
