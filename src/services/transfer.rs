use crate::config::NetworkConfig;
use crate::errors::{ErrorKind, InternalError, Result};
use crate::protocol::{
    FileChunkAckPayload, FileChunkHeader, FileNotFoundPayload, FileRequestPayload,
    FileResponsePayload, MAX_CHUNK_SIZE, Message, MessageType, encode_chunk, new_request_id,
};
use crate::services::checksum::compute_checksum;
use crate::services::events::{EngineEvent, EventBus, TransferProgressPayload};
use crate::services::session::SessionService;
use crate::store::Store;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Sender stops after this many chunks without an ack.
const SEND_WINDOW: usize = 4;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FileRequestResult {
    pub path: PathBuf,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransfer {
    pub request_id: String,
    pub device_id: String,
    pub file_id: i64,
    pub received: u64,
    pub total: u64,
}

struct ActiveState {
    device_id: String,
    file_id: i64,
    received: AtomicU64,
    total: AtomicU64,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    bytes: u64,
    checksum: Option<String>,
    last_access: Instant,
}

/// Chunked pulls of remote files into a byte-capped LRU cache, with `.part`
/// staging for resume.
pub struct TransferService {
    store: Store,
    config: NetworkConfig,
    sessions: Arc<SessionService>,
    events: Arc<EventBus>,
    cache_dir: StdRwLock<PathBuf>,
    cache_cap: AtomicU64,
    entries: DashMap<(String, i64), CacheEntry>,
    total_bytes: AtomicU64,
    active: DashMap<String, Arc<ActiveState>>,
    last_progress: StdMutex<Instant>,
}

impl TransferService {
    pub fn new(
        store: Store,
        config: NetworkConfig,
        sessions: Arc<SessionService>,
        events: Arc<EventBus>,
        cache_dir: PathBuf,
        cache_cap: u64,
    ) -> Self {
        Self {
            store,
            config,
            sessions,
            events,
            cache_dir: StdRwLock::new(cache_dir),
            cache_cap: AtomicU64::new(cache_cap.max(1)),
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            active: DashMap::new(),
            last_progress: StdMutex::new(Instant::now() - PROGRESS_INTERVAL),
        }
    }

    pub async fn set_file_cache_dir(&self, dir: PathBuf) -> Result<()> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(ErrorKind::from)?;
        *self.cache_dir.write().unwrap() = dir;
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Release);
        self.load_cache_entries().await
    }

    /// Rebuild the in-memory cache index from what is on disk.
    async fn load_cache_entries(&self) -> Result<()> {
        let root = self.cache_dir.read().unwrap().clone();
        let mut devices = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Some(device_dir) = devices.next_entry().await.map_err(ErrorKind::from)? {
            if !device_dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let device_id = device_dir.file_name().to_string_lossy().to_string();
            let mut files = match tokio::fs::read_dir(device_dir.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(file) = files.next_entry().await.map_err(ErrorKind::from)? {
                let name = file.file_name().to_string_lossy().to_string();
                if name.ends_with(".part") {
                    continue;
                }
                let Some((id_part, _)) = name.split_once('_') else {
                    continue;
                };
                let Ok(file_id) = id_part.parse::<i64>() else {
                    continue;
                };
                let Ok(metadata) = file.metadata().await else {
                    continue;
                };
                self.insert_entry(
                    device_id.clone(),
                    file_id,
                    CacheEntry {
                        path: file.path(),
                        bytes: metadata.len(),
                        checksum: None,
                        last_access: Instant::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn insert_entry(&self, device_id: String, file_id: i64, entry: CacheEntry) {
        let bytes = entry.bytes;
        if let Some(old) = self.entries.insert((device_id, file_id), entry) {
            self.total_bytes.fetch_sub(old.bytes, Ordering::AcqRel);
        }
        self.total_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.evict_lru();
    }

    /// Drop least-recently-used entries until under the cap. Entries backing
    /// an active transfer are pinned.
    fn evict_lru(&self) {
        let cap = self.cache_cap.load(Ordering::Acquire);
        while self.total_bytes.load(Ordering::Acquire) > cap {
            let active_keys: Vec<(String, i64)> = self
                .active
                .iter()
                .map(|it| (it.device_id.clone(), it.file_id))
                .collect();
            let victim = self
                .entries
                .iter()
                .filter(|entry| !active_keys.contains(entry.key()))
                .min_by_key(|entry| entry.value().last_access)
                .map(|entry| entry.key().clone());
            let Some(key) = victim else {
                break;
            };
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.total_bytes.fetch_sub(entry.bytes, Ordering::AcqRel);
                let path = entry.path.clone();
                tokio::spawn(async move {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(reason = %err, "failed to evict {:?}", path);
                    }
                });
                tracing::debug!("evicted cache entry {:?} ({} bytes)", key, entry.bytes);
            }
        }
    }

    pub fn is_file_cached(&self, device_id: &str, file_id: i64) -> bool {
        self.entries.contains_key(&(device_id.to_string(), file_id))
    }

    pub fn get_cached_file_path(&self, device_id: &str, file_id: i64) -> Option<PathBuf> {
        let mut entry = self.entries.get_mut(&(device_id.to_string(), file_id))?;
        entry.last_access = Instant::now();
        Some(entry.path.clone())
    }

    pub fn get_file_cache_size(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub async fn clear_file_cache(&self) -> Result<()> {
        let root = self.cache_dir.read().unwrap().clone();
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Release);
        if root.exists() {
            tokio::fs::remove_dir_all(&root)
                .await
                .map_err(ErrorKind::from)?;
            tokio::fs::create_dir_all(&root)
                .await
                .map_err(ErrorKind::from)?;
        }
        Ok(())
    }

    pub fn get_active_transfers(&self) -> Vec<ActiveTransfer> {
        self.active
            .iter()
            .map(|entry| ActiveTransfer {
                request_id: entry.key().clone(),
                device_id: entry.device_id.clone(),
                file_id: entry.file_id,
                received: entry.received.load(Ordering::Acquire),
                total: entry.total.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn cancel_file_request(&self, request_id: &str) {
        if let Some(state) = self.active.get(request_id) {
            state.cancel.cancel();
        }
    }

    pub fn cancel_all_file_requests(&self, device_id: &str) {
        for entry in self.active.iter() {
            if entry.device_id == device_id {
                entry.cancel.cancel();
            }
        }
    }

    fn part_path(&self, device_id: &str, file_id: i64) -> PathBuf {
        self.cache_dir
            .read()
            .unwrap()
            .join(device_id)
            .join(format!("{file_id}.part"))
    }

    fn final_path(&self, device_id: &str, file_id: i64, name: &str) -> PathBuf {
        // flatten any path-ish characters out of the display name
        let safe: String = name
            .chars()
            .map(|c| if std::path::is_separator(c) { '_' } else { c })
            .collect();
        self.cache_dir
            .read()
            .unwrap()
            .join(device_id)
            .join(format!("{file_id}_{safe}"))
    }

    /// Pull one remote file. A cache hit (with matching checksum, when one is
    /// expected) answers immediately; otherwise the transfer resumes from any
    /// `.part` left by an earlier attempt.
    pub async fn request_file(
        &self,
        device_id: &str,
        remote_file_id: i64,
        name: &str,
        expected_size: u64,
        checksum: Option<String>,
    ) -> Result<FileRequestResult> {
        if let Some(entry) = self
            .entries
            .get(&(device_id.to_string(), remote_file_id))
            .map(|it| it.value().clone())
        {
            let checksum_ok = match (&checksum, &entry.checksum) {
                (Some(expected), Some(cached)) => expected == cached,
                _ => true,
            };
            if checksum_ok && entry.path.exists() {
                self.get_cached_file_path(device_id, remote_file_id);
                return Ok(FileRequestResult {
                    path: entry.path,
                    from_cache: true,
                });
            }
            self.entries.remove(&(device_id.to_string(), remote_file_id));
            self.total_bytes.fetch_sub(entry.bytes, Ordering::AcqRel);
        }

        let part = self.part_path(device_id, remote_file_id);
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                ErrorKind::io_context(
                    err,
                    InternalError::CreateDirectoryError {
                        path: parent.to_owned(),
                    },
                )
            })?;
        }
        let offset = match tokio::fs::metadata(&part).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let request = Message::json(
            MessageType::FileRequest,
            new_request_id(),
            &FileRequestPayload {
                file_id: remote_file_id,
                checksum: checksum.clone(),
                offset,
                length: None,
            },
        )?;
        let (request_id, mut rx) = self.sessions.open_stream(device_id, request, 16).await?;
        let state = Arc::new(ActiveState {
            device_id: device_id.to_string(),
            file_id: remote_file_id,
            received: AtomicU64::new(offset),
            total: AtomicU64::new(expected_size),
            cancel: CancellationToken::new(),
        });
        self.active.insert(request_id.clone(), state.clone());

        let outcome = self
            .receive_file(device_id, &request_id, &mut rx, &state, &part, name, checksum)
            .await;
        self.sessions.close_stream(device_id, &request_id);
        self.active.remove(&request_id);

        match outcome {
            Ok(path) => {
                self.events.send(EngineEvent::FileTransferComplete {
                    request_id: request_id.clone(),
                    file_id: remote_file_id,
                    path: path.to_string_lossy().to_string(),
                });
                Ok(FileRequestResult {
                    path,
                    from_cache: false,
                })
            }
            Err(err) => {
                let resumable = matches!(err, ErrorKind::PeerDisconnected | ErrorKind::Timeout);
                if !resumable {
                    let _ = tokio::fs::remove_file(&part).await;
                }
                if matches!(err, ErrorKind::Cancelled) {
                    // tell the sender to stop streaming this request
                    let bye = Message::new(MessageType::Disconnect, request_id.clone(), Vec::new());
                    let _ = self.sessions.send(device_id, bye).await;
                } else {
                    self.events.send(EngineEvent::FileTransferError {
                        request_id: request_id.clone(),
                        kind: err.kind().to_string(),
                        resumable,
                    });
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_file(
        &self,
        device_id: &str,
        request_id: &str,
        rx: &mut tokio::sync::mpsc::Receiver<Message>,
        state: &Arc<ActiveState>,
        part: &Path,
        name: &str,
        expected_checksum: Option<String>,
    ) -> Result<PathBuf> {
        let idle = Duration::from_secs(self.config.transfer_idle_timeout_secs);
        let first = tokio::select! {
            _ = state.cancel.cancelled() => return Err(ErrorKind::Cancelled),
            frame = tokio::time::timeout(idle, rx.recv()) => frame
                .map_err(|_| ErrorKind::Timeout)?
                .ok_or(ErrorKind::PeerDisconnected)?,
        };
        let declared_checksum = match first.kind {
            MessageType::FileNotFound => return Err(ErrorKind::NotFound),
            MessageType::FileResponse => {
                let response: FileResponsePayload = first.parse_json()?;
                state.total.store(response.total_size, Ordering::Release);
                response.checksum.or(expected_checksum)
            }
            MessageType::Error => return Err(ErrorKind::ProtocolError("peer error".to_string())),
            _ => return Err(ErrorKind::ProtocolError("expected FileResponse".to_string())),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(part)
            .await
            .map_err(|err| {
                ErrorKind::io_context(
                    err,
                    InternalError::AccessFileError {
                        path: part.to_owned(),
                    },
                )
            })?;
        let mut received = state.received.load(Ordering::Acquire);
        file.seek(std::io::SeekFrom::Start(received))
            .await
            .map_err(|err| {
                ErrorKind::io_context(
                    err,
                    InternalError::FileSeekError {
                        path: part.to_owned(),
                    },
                )
            })?;

        let started = Instant::now();
        let start_offset = received;
        loop {
            let frame = tokio::select! {
                _ = state.cancel.cancelled() => return Err(ErrorKind::Cancelled),
                frame = tokio::time::timeout(idle, rx.recv()) => frame
                    .map_err(|_| ErrorKind::Timeout)?
                    .ok_or(ErrorKind::PeerDisconnected)?,
            };
            if frame.kind != MessageType::FileChunk {
                return Err(ErrorKind::ProtocolError("expected FileChunk".to_string()));
            }
            let header = FileChunkHeader::decode(&frame.payload)
                .ok_or_else(|| ErrorKind::ProtocolError("short chunk header".to_string()))?;
            if header.offset != received {
                return Err(ErrorKind::ProtocolError(format!(
                    "chunk out of order: expected offset {received}, got {}",
                    header.offset
                )));
            }
            let bytes = &frame.payload[crate::protocol::FILE_CHUNK_HEADER_LEN..];
            if bytes.len() != header.chunk_size as usize {
                return Err(ErrorKind::ProtocolError("chunk size mismatch".to_string()));
            }
            file.write_all(bytes).await.map_err(|err| {
                ErrorKind::io_context(
                    err,
                    InternalError::WriteFileError {
                        path: part.to_owned(),
                    },
                )
            })?;
            received += bytes.len() as u64;
            state.received.store(received, Ordering::Release);
            state.total.store(header.total_size, Ordering::Release);

            let ack = Message::json(
                MessageType::FileChunkAck,
                request_id.to_string(),
                &FileChunkAckPayload { offset: received },
            )?;
            self.sessions.send(device_id, ack).await?;
            self.emit_progress(request_id, state, started, start_offset);

            if header.is_last {
                break;
            }
        }
        file.sync_all().await.map_err(ErrorKind::from)?;
        drop(file);

        if let Some(declared) = &declared_checksum {
            let actual = compute_checksum(part).await?;
            if &actual != declared {
                let _ = tokio::fs::remove_file(part).await;
                return Err(ErrorKind::ChecksumMismatch {
                    expected: declared.clone(),
                    actual,
                });
            }
        }
        let final_path = self.final_path(device_id, state.file_id, name);
        tokio::fs::rename(part, &final_path).await.map_err(|err| {
            ErrorKind::io_context(
                err,
                InternalError::RenameFileError {
                    from_path: part.to_owned(),
                    to_path: final_path.clone(),
                },
            )
        })?;
        self.insert_entry(
            device_id.to_string(),
            state.file_id,
            CacheEntry {
                path: final_path.clone(),
                bytes: received,
                checksum: declared_checksum,
                last_access: Instant::now(),
            },
        );
        Ok(final_path)
    }

    /// 10 Hz across all transfers; per-chunk events would flood the bus.
    fn emit_progress(
        &self,
        request_id: &str,
        state: &ActiveState,
        started: Instant,
        start_offset: u64,
    ) {
        {
            let mut last = self.last_progress.lock().unwrap();
            if last.elapsed() < PROGRESS_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let received = state.received.load(Ordering::Acquire);
        let elapsed = started.elapsed().as_secs_f64().max(0.001);
        self.events
            .send(EngineEvent::FileTransferProgress(TransferProgressPayload {
                request_id: request_id.to_string(),
                device_id: state.device_id.clone(),
                file_id: state.file_id,
                received,
                total: state.total.load(Ordering::Acquire),
                bytes_per_sec: ((received - start_offset) as f64 / elapsed) as u64,
            }));
    }

    /// Responder side: stream the requested local file in acked windows.
    pub async fn handle_file_request(
        &self,
        device_id: &str,
        request_id: &str,
        payload: FileRequestPayload,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT f.name, f.checksum, f.relative_path, w.path AS folder_path \
             FROM files f JOIN watched_folders w ON w.id = f.folder_id \
             WHERE f.id = ? AND f.source_device_id IS NULL",
        )
        .bind(payload.file_id)
        .fetch_optional(self.store.pool())
        .await?;
        let not_found = Message::json(
            MessageType::FileNotFound,
            request_id.to_string(),
            &FileNotFoundPayload {
                file_id: payload.file_id,
            },
        )?;
        let Some(row) = row else {
            return self.sessions.send(device_id, not_found).await;
        };
        let checksum: Option<String> = row.try_get("checksum")?;
        if let (Some(expected), Some(actual)) = (&payload.checksum, &checksum) {
            // the row changed since the peer indexed it
            if expected != actual {
                return self.sessions.send(device_id, not_found).await;
            }
        }
        let full_path = PathBuf::from(row.try_get::<String, _>("folder_path")?)
            .join(row.try_get::<String, _>("relative_path")?);
        let mut file = match tokio::fs::File::open(&full_path).await {
            Ok(file) => file,
            Err(_) => return self.sessions.send(device_id, not_found).await,
        };
        let total_size = file
            .metadata()
            .await
            .map_err(|err| {
                ErrorKind::io_context(
                    err,
                    InternalError::ReadMetadataError {
                        path: full_path.clone(),
                    },
                )
            })?
            .len();
        let name: String = row.try_get("name")?;

        let mut control = self.sessions.register_stream(device_id, request_id, 16)?;
        let result = async {
            let response = Message::json(
                MessageType::FileResponse,
                request_id.to_string(),
                &FileResponsePayload {
                    file_id: payload.file_id,
                    name,
                    total_size,
                    checksum,
                },
            )?;
            self.sessions.send(device_id, response).await?;

            let mut offset = payload.offset.min(total_size);
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|err| {
                    ErrorKind::io_context(
                        err,
                        InternalError::FileSeekError {
                            path: full_path.clone(),
                        },
                    )
                })?;
            let end = payload
                .length
                .map(|len| (offset + len).min(total_size))
                .unwrap_or(total_size);
            let idle = Duration::from_secs(self.config.transfer_idle_timeout_secs);
            let mut buf = vec![0u8; MAX_CHUNK_SIZE];
            let mut unacked = 0usize;
            loop {
                let remaining = (end - offset) as usize;
                let want = remaining.min(MAX_CHUNK_SIZE);
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..want]).await.map_err(|err| {
                        ErrorKind::io_context(
                            err,
                            InternalError::ReadFileError {
                                path: full_path.clone(),
                            },
                        )
                    })?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                let is_last = offset + filled as u64 >= end;
                let header = FileChunkHeader {
                    file_id: payload.file_id as u64,
                    offset,
                    total_size,
                    chunk_size: filled as u32,
                    is_last,
                };
                let chunk = Message::new(
                    MessageType::FileChunk,
                    request_id.to_string(),
                    encode_chunk(&header, &buf[..filled]),
                );
                self.sessions.send(device_id, chunk).await?;
                offset += filled as u64;
                unacked += 1;

                // drain pending control frames without blocking
                while let Ok(frame) = control.try_recv() {
                    match frame.kind {
                        MessageType::Disconnect => return Err(ErrorKind::Cancelled),
                        MessageType::FileChunkAck => unacked = unacked.saturating_sub(1),
                        _ => {}
                    }
                }
                if is_last {
                    break;
                }
                while unacked >= SEND_WINDOW {
                    let frame = tokio::time::timeout(idle, control.recv())
                        .await
                        .map_err(|_| ErrorKind::Timeout)?
                        .ok_or(ErrorKind::PeerDisconnected)?;
                    match frame.kind {
                        MessageType::Disconnect => return Err(ErrorKind::Cancelled),
                        MessageType::FileChunkAck => unacked = unacked.saturating_sub(1),
                        _ => {}
                    }
                }
            }
            Ok(())
        }
        .await;
        self.sessions.close_stream(device_id, request_id);
        if let Err(err) = &result {
            tracing::debug!(reason = %err, "file send to {device_id} ended early");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::discovery::DiscoveryService;
    use crate::services::identity::LocalIdentity;
    use crate::services::pairing::PairingService;
    use std::sync::RwLock;

    async fn service(cache_cap: u64) -> (TransferService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let identity = Arc::new(RwLock::new(LocalIdentity {
            device_id: "cache-test".into(),
            device_name: "cache".into(),
            device_type: 0,
            family_id: None,
            family_secret: None,
        }));
        let events = Arc::new(EventBus::new());
        let config = NetworkConfig::default();
        let discovery = Arc::new(DiscoveryService::new(
            config.clone(),
            identity.clone(),
            events.clone(),
        ));
        let pairing = Arc::new(PairingService::new(store.clone(), identity.clone()));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            config.clone(),
            identity,
            events.clone(),
            discovery,
            pairing,
        ));
        let service = TransferService::new(
            store,
            config,
            sessions,
            events,
            dir.path().to_path_buf(),
            cache_cap,
        );
        (service, dir)
    }

    fn entry(path: PathBuf, bytes: u64, age_secs: u64) -> CacheEntry {
        CacheEntry {
            path,
            bytes,
            checksum: None,
            last_access: Instant::now() - Duration::from_secs(age_secs),
        }
    }

    #[tokio::test]
    async fn lru_eviction_respects_cap_and_age() {
        let (service, dir) = service(250).await;
        for (i, age) in [(1i64, 30u64), (2, 20), (3, 10)] {
            let path = dir.path().join(format!("{i}_f"));
            std::fs::write(&path, vec![0u8; 100]).unwrap();
            service.insert_entry("dev".into(), i, entry(path, 100, age));
        }
        // 300 bytes > 250 cap: the oldest entry goes
        assert_eq!(service.get_file_cache_size(), 200);
        assert!(!service.is_file_cached("dev", 1));
        assert!(service.is_file_cached("dev", 2));
        assert!(service.is_file_cached("dev", 3));
    }

    #[tokio::test]
    async fn active_transfers_are_never_evicted() {
        let (service, dir) = service(150).await;
        service.active.insert(
            "req-1".to_string(),
            Arc::new(ActiveState {
                device_id: "dev".into(),
                file_id: 1,
                received: AtomicU64::new(0),
                total: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        );
        let pinned = dir.path().join("1_pinned");
        std::fs::write(&pinned, vec![0u8; 100]).unwrap();
        service.insert_entry("dev".into(), 1, entry(pinned, 100, 100));
        let fresh = dir.path().join("2_fresh");
        std::fs::write(&fresh, vec![0u8; 100]).unwrap();
        service.insert_entry("dev".into(), 2, entry(fresh, 100, 1));
        // pinned entry is older but survives; the fresh one is evicted
        assert!(service.is_file_cached("dev", 1));
        assert!(!service.is_file_cached("dev", 2));
    }

    #[tokio::test]
    async fn cache_round_trip_and_clear() {
        let (service, _dir) = service(1_000_000).await;
        let root = service.cache_dir.read().unwrap().clone();
        let device_dir = root.join("peer-a");
        std::fs::create_dir_all(&device_dir).unwrap();
        std::fs::write(device_dir.join("42_photo.jpg"), b"bytes!").unwrap();
        std::fs::write(device_dir.join("9.part"), b"partial").unwrap();
        service.load_cache_entries().await.unwrap();
        assert!(service.is_file_cached("peer-a", 42));
        // .part files never count as cache hits
        assert!(!service.is_file_cached("peer-a", 9));
        assert_eq!(service.get_file_cache_size(), 6);
        let path = service.get_cached_file_path("peer-a", 42).unwrap();
        assert!(path.ends_with("42_photo.jpg"));
        service.clear_file_cache().await.unwrap();
        assert_eq!(service.get_file_cache_size(), 0);
        assert!(!service.is_file_cached("peer-a", 42));
    }

    #[tokio::test]
    async fn request_to_unconnected_peer_is_peer_disconnected() {
        let (service, _dir) = service(1000).await;
        let err = service
            .request_file("nobody", 1, "x", 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::PeerDisconnected));
    }
}
