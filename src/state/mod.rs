use crate::config::Config;
use crate::errors::{ErrorKind, Result};
use crate::protocol::{Message, MessageType, RemoteSearchHit, SearchResponsePayload};
use crate::services::discovery::DiscoveryService;
use crate::services::duplicates::DuplicateService;
use crate::services::events::EventBus;
use crate::services::extract::ExtractService;
use crate::services::identity::{self, IdentityHandle};
use crate::services::index::IndexService;
use crate::services::pairing::PairingService;
use crate::services::scanner::ScanService;
use crate::services::search::SearchService;
use crate::services::session::{InboundRequest, SessionService};
use crate::services::sync::SyncService;
use crate::services::transfer::TransferService;
use crate::store::Store;
use anyhow::Context;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThisDeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub family_id: Option<String>,
    pub paired: bool,
    pub tcp_port: Option<u16>,
}

/// The process-wide engine value. Shells call `init` once, talk to the
/// service handles, subscribe to `events`, and `shutdown` on exit.
pub struct Engine {
    pub store: Store,
    pub events: Arc<EventBus>,
    pub index: Arc<IndexService>,
    pub scanner: Arc<ScanService>,
    pub extract: Arc<ExtractService>,
    pub search: Arc<SearchService>,
    pub duplicates: Arc<DuplicateService>,
    pub discovery: Arc<DiscoveryService>,
    pub pairing: Arc<PairingService>,
    pub sessions: Arc<SessionService>,
    pub sync: Arc<SyncService>,
    pub transfer: Arc<TransferService>,
    identity: IdentityHandle,
    shutdown: CancellationToken,
    network: StdMutex<Option<CancellationToken>>,
}

impl Engine {
    pub async fn init(config: Config) -> anyhow::Result<Engine> {
        let data_dir = config.storage.parse_data_dir()?;
        let cache_dir = config.storage.parse_cache_dir()?;
        let store = Store::open(&data_dir).await?;
        let identity = identity::load_or_create(&store, &config.device)
            .await
            .map_err(|e| anyhow::format_err!("{e}"))
            .context("Failed to load device identity")?;
        let events = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();

        let scan_gate = Arc::new(Mutex::new(()));
        let (extract_tx, extract_rx) = mpsc::unbounded_channel();

        let index = Arc::new(IndexService::new(store.clone(), events.clone()));
        let scanner = Arc::new(ScanService::new(
            store.clone(),
            events.clone(),
            scan_gate.clone(),
            extract_tx.clone(),
        ));
        let extract = Arc::new(ExtractService::new(
            store.clone(),
            config.storage.max_text_size_bytes(),
            scan_gate,
            extract_rx,
        ));
        let search = Arc::new(SearchService::new(store.clone()));
        let duplicates = Arc::new(DuplicateService::new(store.clone(), events.clone()));
        let discovery = Arc::new(DiscoveryService::new(
            config.network.clone(),
            identity.clone(),
            events.clone(),
        ));
        let pairing = Arc::new(PairingService::new(store.clone(), identity.clone()));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            config.network.clone(),
            identity.clone(),
            events.clone(),
            discovery.clone(),
            pairing.clone(),
        ));
        let sync = Arc::new(SyncService::new(
            store.clone(),
            sessions.clone(),
            events.clone(),
            config.storage.max_text_size_kb,
        ));
        let transfer = Arc::new(TransferService::new(
            store.clone(),
            config.network.clone(),
            sessions.clone(),
            events.clone(),
            cache_dir.clone(),
            config.storage.cache_cap_bytes,
        ));
        transfer
            .set_file_cache_dir(cache_dir)
            .await
            .map_err(|e| anyhow::format_err!("Failed to prepare file cache: {e}"))?;

        if let Ok(queued) = extract.backfill(&extract_tx).await {
            if queued > 0 {
                tracing::info!("queued {queued} files for text extraction");
            }
        }
        extract.start(shutdown.child_token());

        let engine = Engine {
            store,
            events,
            index,
            scanner,
            extract,
            search,
            duplicates,
            discovery,
            pairing,
            sessions,
            sync,
            transfer,
            identity,
            shutdown,
            network: StdMutex::new(None),
        };
        engine.spawn_dispatcher();
        Ok(engine)
    }

    /// Routes inbound peer requests to the owning service.
    fn spawn_dispatcher(&self) {
        let Some(mut inbound) = self.sessions.take_inbound() else {
            return;
        };
        let sync = self.sync.clone();
        let transfer = self.transfer.clone();
        let search = self.search.clone();
        let sessions = self.sessions.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = inbound.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let InboundRequest { device_id, message } = request;
                match message.kind {
                    MessageType::IndexSyncRequest => {
                        let payload = match message.parse_json() {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!(reason = %err, "bad sync request from {device_id}");
                                continue;
                            }
                        };
                        let sync = sync.clone();
                        tokio::spawn(async move {
                            if let Err(err) = sync
                                .handle_sync_request(&device_id, &message.request_id, payload)
                                .await
                            {
                                tracing::warn!(reason = %err, "sync response to {device_id} failed");
                            }
                        });
                    }
                    MessageType::FileRequest => {
                        let payload = match message.parse_json() {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!(reason = %err, "bad file request from {device_id}");
                                continue;
                            }
                        };
                        let transfer = transfer.clone();
                        tokio::spawn(async move {
                            if let Err(err) = transfer
                                .handle_file_request(&device_id, &message.request_id, payload)
                                .await
                            {
                                tracing::debug!(reason = %err, "file send to {device_id} ended: {err}");
                            }
                        });
                    }
                    MessageType::SearchRequest => {
                        let search = search.clone();
                        let sessions = sessions.clone();
                        tokio::spawn(async move {
                            let reply =
                                answer_search(&search, &message).await.unwrap_or_else(|err| {
                                    tracing::warn!(reason = %err, "search for {device_id} failed");
                                    SearchResponsePayload { results: Vec::new() }
                                });
                            if let Ok(frame) = Message::json(
                                MessageType::SearchResponse,
                                message.request_id.clone(),
                                &reply,
                            ) {
                                let _ = sessions.send(&device_id, frame).await;
                            }
                        });
                    }
                    // stray flow-control frames after a stream closed
                    MessageType::IndexDeltaAck | MessageType::FileChunkAck => {}
                    other => {
                        tracing::debug!("unhandled inbound {other:?} from {device_id}");
                    }
                }
            }
        });
    }

    /// Start discovery, the session listener and connect-time sync.
    pub async fn start_network(&self) -> Result<()> {
        let mut slot = self.network.lock().unwrap();
        if slot.is_some() {
            return Err(ErrorKind::AlreadyExists("network".to_string()));
        }
        let cancel = self.shutdown.child_token();
        *slot = Some(cancel.clone());
        drop(slot);
        // subscribe before the listener so the first connection cannot race
        // past the connect-time sync trigger
        self.sync.setup_index_sync(cancel.clone());
        self.discovery.start(cancel.clone()).await?;
        self.sessions.start(cancel).await?;
        tracing::info!(target: "event", "network started");
        Ok(())
    }

    pub async fn stop_network(&self) {
        let token = self.network.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.sessions.stop().await;
        tracing::info!(target: "event", "network stopped");
    }

    pub fn is_network_running(&self) -> bool {
        self.network.lock().unwrap().is_some()
    }

    pub fn get_this_device_info(&self) -> ThisDeviceInfo {
        let identity = self.identity.read().unwrap();
        ThisDeviceInfo {
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            device_type: identity.device_type,
            family_id: identity.family_id.clone(),
            paired: identity.family_secret.is_some(),
            tcp_port: self.sessions.local_addr().map(|addr| addr.port()),
        }
    }

    pub fn get_local_ip_addresses(&self) -> Vec<String> {
        DiscoveryService::local_ip_addresses()
    }

    /// Every device that has ever proven the family secret.
    pub async fn get_trusted_devices(&self) -> Result<Vec<crate::models::Device>> {
        let sql = format!(
            "SELECT {} FROM devices WHERE trusted = 1 ORDER BY name COLLATE NOCASE",
            crate::models::Device::COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.pool()).await?;
        let mut devices = Vec::with_capacity(rows.len());
        for row in &rows {
            devices.push(crate::models::Device::from_row(row)?);
        }
        Ok(devices)
    }

    /// Run a query on a connected peer; it answers from its local index only.
    pub async fn search_peer(
        &self,
        device_id: &str,
        query: crate::services::SearchQuery,
    ) -> Result<Vec<RemoteSearchHit>> {
        let request = Message::json(
            MessageType::SearchRequest,
            crate::protocol::new_request_id(),
            &crate::protocol::SearchRequestPayload { query },
        )?;
        let response = self
            .sessions
            .request(device_id, request, std::time::Duration::from_secs(30))
            .await?;
        if response.kind != MessageType::SearchResponse {
            return Err(ErrorKind::ProtocolError("expected SearchResponse".to_string()));
        }
        let payload: SearchResponsePayload = response.parse_json()?;
        Ok(payload.results)
    }

    pub async fn shutdown(&self) {
        self.stop_network().await;
        self.extract.stop();
        self.shutdown.cancel();
        self.store.close().await;
        tracing::info!("engine shut down");
    }
}

async fn answer_search(
    search: &SearchService,
    message: &Message,
) -> Result<SearchResponsePayload> {
    let request: crate::protocol::SearchRequestPayload = message.parse_json()?;
    let mut query = request.query;
    // never echo third-party rows back out
    query.include_remote = false;
    let results = search.search(&query).await?;
    Ok(SearchResponsePayload {
        results: results
            .into_iter()
            .map(|result| RemoteSearchHit {
                file_id: result.file.id,
                name: result.file.name,
                path: result.file.relative_path.unwrap_or_default(),
                mime_type: result.file.mime_type,
                size: result.file.size,
                modified_at: result.file.modified_at.millis(),
                checksum: result.file.checksum,
                score: result.score,
                snippet: result.snippet,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Visibility;
    use crate::services::events::EngineEvent;
    use std::io::Write;
    use std::time::Duration;

    async fn engine_in(dir: &std::path::Path) -> Engine {
        let config = Config::from_toml(&format!(
            r#"
            [device]
            name = "node"

            [network]
            tcp_port = 0

            [storage]
            data_path = "{}"
            "#,
            dir.display()
        ))
        .unwrap();
        Engine::init(config).await.unwrap()
    }

    /// Pair two engines over localhost, sync the index, then pull the file
    /// bytes across.
    #[tokio::test]
    async fn pair_sync_and_transfer_end_to_end() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let watched = tempfile::tempdir().unwrap();
        let photo_bytes: Vec<u8> = {
            let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
            bytes.extend((0..70_000u32).map(|i| (i % 253) as u8));
            bytes
        };
        std::fs::File::create(watched.path().join("photo.jpg"))
            .unwrap()
            .write_all(&photo_bytes)
            .unwrap();

        let a = engine_in(dir_a.path()).await;
        let b = engine_in(dir_b.path()).await;

        // host side: index + family + listener
        let folder_id = a
            .index
            .add_folder(watched.path(), None, Visibility::Family)
            .await
            .unwrap();
        a.scanner
            .scan_folder(folder_id, CancellationToken::new())
            .await
            .unwrap();
        a.scanner
            .compute_missing_checksums(CancellationToken::new())
            .await
            .unwrap();
        let indexed = a.index.get_recent(1).await.unwrap();
        let full = a.index.resolve_full_path(&indexed[0]).await.unwrap();
        assert!(full.ends_with("photo.jpg"));
        a.pairing.create_family().await.unwrap();
        let pin = a.pairing.regenerate_pin().unwrap();
        a.sessions.start(CancellationToken::new()).await.unwrap();
        let addr_a = a.sessions.local_addr().unwrap();

        // joiner side: pair over the wire, then open a session
        b.sessions.start(CancellationToken::new()).await.unwrap();
        assert!(!b.pairing.is_family_configured());
        b.pairing
            .join_family_by_pin(&pin, "127.0.0.1", addr_a.port())
            .await
            .unwrap();
        assert!(a.pairing.is_family_configured());
        assert!(b.pairing.is_family_configured());

        let a_id = b
            .sessions
            .connect_to_endpoint(addr_a, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let b_id = b.get_this_device_info().device_id;
        assert!(a.sessions.is_connected(&b_id));
        assert!(b.sessions.is_connected(&a_id));
        let trusted = a.get_trusted_devices().await.unwrap();
        assert!(trusted.iter().any(|d| d.device_id == b_id && d.trusted));

        // delta sync: B learns about A's photo
        let applied = b.sync.request_sync(&a_id).await.unwrap();
        assert_eq!(applied, 1);
        let remote = b.sync.get_remote_files(Some(&a_id)).await.unwrap();
        assert_eq!(remote.len(), 1);
        let photo = &remote[0];
        assert_eq!(photo.name, "photo.jpg");
        assert_eq!(photo.size as usize, photo_bytes.len());
        let checksum = photo.checksum.clone().unwrap();
        assert!(checksum.starts_with("sha256:"));
        assert_eq!(b.sync.get_remote_file_count().await.unwrap(), 1);

        // remote leg shows up in B's search
        let hits = b
            .search
            .search(&crate::services::SearchQuery {
                text: Some("photo".into()),
                include_remote: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].file.is_remote());

        // ask A to search on our behalf
        let remote_hits = b
            .search_peer(
                &a_id,
                crate::services::SearchQuery {
                    text: Some("photo".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(remote_hits.len(), 1);
        assert_eq!(remote_hits[0].name, "photo.jpg");

        // pull the bytes; completion fires exactly once
        let mut events = b.events.subscribe();
        let result = b
            .transfer
            .request_file(
                &a_id,
                photo.remote_file_id.unwrap(),
                &photo.name,
                photo.size as u64,
                Some(checksum.clone()),
            )
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert_eq!(std::fs::read(&result.path).unwrap(), photo_bytes);
        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::FileTransferComplete { .. }) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);

        // second request is a cache hit
        let again = b
            .transfer
            .request_file(
                &a_id,
                photo.remote_file_id.unwrap(),
                &photo.name,
                photo.size as u64,
                Some(checksum),
            )
            .await
            .unwrap();
        assert!(again.from_cache);
        assert_eq!(again.path, result.path);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn this_device_info_reflects_pairing_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path()).await;
        let info = engine.get_this_device_info();
        assert!(!info.paired);
        assert_eq!(info.device_id.len(), 36);
        engine.pairing.create_family().await.unwrap();
        let info = engine.get_this_device_info();
        assert!(info.paired);
        assert!(info.family_id.is_some());
        engine.shutdown().await;
    }
}
