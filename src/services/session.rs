use crate::config::NetworkConfig;
use crate::errors::{ErrorKind, Result};
use crate::models::Timestamp;
use crate::protocol::{
    DeviceInfoPayload, ErrorPayload, Message, MessageType, PROTOCOL_VERSION, new_request_id,
    read_message, write_message,
};
use crate::services::discovery::DiscoveryService;
use crate::services::events::{EngineEvent, EventBus};
use crate::services::identity::IdentityHandle;
use crate::services::pairing::PairingService;
use crate::store::Store;
use crate::utils::{from_hex, to_hex};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use sha2::Sha256;
use sqlx::Row;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// A frame that is not a response to anything we sent; routed to the engine
/// dispatcher (sync, transfer, search).
#[derive(Debug)]
pub struct InboundRequest {
    pub device_id: String,
    pub message: Message,
}

enum PendingSlot {
    Oneshot(oneshot::Sender<Message>),
    Stream(mpsc::Sender<Message>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPeer {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub address: String,
    pub file_count: i64,
    pub last_sync_timestamp: i64,
}

struct SessionHandle {
    device_id: String,
    peer: ConnectedPeer,
    initiated_by_us: bool,
    writer_tx: mpsc::Sender<Message>,
    pending: Arc<DashMap<String, PendingSlot>>,
    cancel: CancellationToken,
    last_inbound: Arc<StdMutex<Instant>>,
}

/// One authenticated TCP session per trusted peer: family-secret handshake,
/// heartbeats, request/response routing by request id.
pub struct SessionService {
    store: Store,
    config: NetworkConfig,
    identity: IdentityHandle,
    events: Arc<EventBus>,
    discovery: Arc<DiscoveryService>,
    pairing: Arc<PairingService>,
    sessions: Arc<DashMap<String, Arc<SessionHandle>>>,
    inbound_tx: mpsc::Sender<InboundRequest>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundRequest>>>,
    listen_addr: StdMutex<Option<SocketAddr>>,
    net_cancel: StdMutex<Option<CancellationToken>>,
    running: AtomicBool,
}

impl SessionService {
    pub fn new(
        store: Store,
        config: NetworkConfig,
        identity: IdentityHandle,
        events: Arc<EventBus>,
        discovery: Arc<DiscoveryService>,
        pairing: Arc<PairingService>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        Self {
            store,
            config,
            identity,
            events,
            discovery,
            pairing,
            sessions: Arc::new(DashMap::new()),
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            listen_addr: StdMutex::new(None),
            net_cancel: StdMutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// The engine's dispatcher takes this exactly once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.inbound_rx.lock().unwrap().take()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().unwrap()
    }

    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.tcp_port))
            .await
            .map_err(ErrorKind::from)?;
        let addr = listener.local_addr().map_err(ErrorKind::from)?;
        *self.listen_addr.lock().unwrap() = Some(addr);
        *self.net_cancel.lock().unwrap() = Some(cancel.clone());
        self.running.store(true, Ordering::Release);
        tracing::info!("session listener on tcp {addr}");

        // accept loop
        {
            let service = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, peer_addr) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(reason = %err, "accept failed");
                                continue;
                            }
                        },
                    };
                    let service = service.clone();
                    tokio::spawn(async move {
                        if let Err(err) = service.handle_incoming(stream, peer_addr).await {
                            tracing::debug!(reason = %err, "incoming connection from {peer_addr} rejected");
                        }
                    });
                }
                tracing::debug!("session listener stopped");
            });
        }
        // dial supervisor: keep sessions to every trusted, visible peer
        {
            let service = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    if let Err(err) = service.dial_trusted_peers().await {
                        tracing::debug!(reason = %err, "dial sweep failed");
                    }
                }
            });
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(cancel) = self.net_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let handles: Vec<_> = self.sessions.iter().map(|it| it.value().clone()).collect();
        for handle in handles {
            self.close_session(&handle.device_id).await;
        }
    }

    async fn dial_trusted_peers(self: &Arc<Self>) -> Result<()> {
        if self.identity.read().unwrap().family_secret.is_none() {
            return Ok(());
        }
        let rows = sqlx::query("SELECT device_id FROM devices WHERE trusted = 1")
            .fetch_all(self.store.pool())
            .await?;
        for row in rows {
            let device_id: String = row.try_get("device_id")?;
            if self.sessions.contains_key(&device_id) {
                continue;
            }
            let Some(endpoint) = self.discovery.peer_endpoint(&device_id) else {
                continue;
            };
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(err) = service.connect_to_endpoint(endpoint, Some(&device_id)).await {
                    tracing::debug!(reason = %err, "dial to {device_id} failed");
                }
            });
        }
        Ok(())
    }

    /// Dial and run the initiator side of the handshake. Returns the peer's
    /// device id.
    pub async fn connect_to_endpoint(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected_device: Option<&str>,
    ) -> Result<String> {
        let secret = self
            .identity
            .read()
            .unwrap()
            .family_secret
            .clone()
            .ok_or(ErrorKind::AuthFailed)?;
        let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ErrorKind::Timeout)?
            .map_err(|_| ErrorKind::PeerDisconnected)?;

        let our_nonce = new_nonce();
        let request_id = new_request_id();
        let hello = Message::json(
            MessageType::DeviceInfoRequest,
            request_id.clone(),
            &self.own_info(Some(our_nonce.clone()), None).await?,
        )?;
        write_message(&mut stream, &hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| ErrorKind::Timeout)??
            .ok_or(ErrorKind::PeerDisconnected)?;
        if reply.kind == MessageType::Error {
            return Err(error_from_payload(&reply));
        }
        if reply.kind != MessageType::DeviceInfo {
            return Err(ErrorKind::ProtocolError("expected DeviceInfo".to_string()));
        }
        let info: DeviceInfoPayload = reply.parse_json()?;
        let their_nonce = info
            .nonce
            .clone()
            .ok_or_else(|| ErrorKind::ProtocolError("missing nonce".to_string()))?;
        if !verify_proof(&secret, &our_nonce, info.proof.as_deref()) {
            let error = Message::json(
                MessageType::Error,
                request_id,
                &ErrorPayload {
                    kind: ErrorKind::AuthFailed.kind().to_string(),
                    message: ErrorKind::AuthFailed.to_string(),
                },
            )?;
            let _ = write_message(&mut stream, &error).await;
            return Err(ErrorKind::AuthFailed);
        }
        if let Some(expected) = expected_device {
            if expected != info.device_id {
                return Err(ErrorKind::ProtocolError("peer identity mismatch".to_string()));
            }
        }
        let finish = Message::json(
            MessageType::DeviceInfo,
            request_id,
            &self
                .own_info(None, Some(auth_proof(&secret, &their_nonce)))
                .await?,
        )?;
        write_message(&mut stream, &finish).await?;

        let device_id = info.device_id.clone();
        self.register_session(stream, addr, info, true).await?;
        Ok(device_id)
    }

    /// Accept side: first frame decides between pairing and session auth.
    async fn handle_incoming(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| ErrorKind::Timeout)??
            .ok_or(ErrorKind::PeerDisconnected)?;
        match first.kind {
            MessageType::PairingRequest => {
                let request = first.parse_json()?;
                let response = self.pairing.handle_pairing_request(&request).await;
                let reply =
                    Message::json(MessageType::PairingResponse, first.request_id, &response)?;
                write_message(&mut stream, &reply).await?;
                Ok(())
            }
            MessageType::DeviceInfoRequest => {
                let secret = { self.identity.read().unwrap().family_secret.clone() };
                let secret = match secret {
                    Some(secret) => secret,
                    None => {
                        let error = Message::json(
                            MessageType::Error,
                            first.request_id.clone(),
                            &ErrorPayload {
                                kind: ErrorKind::AuthFailed.kind().to_string(),
                                message: ErrorKind::AuthFailed.to_string(),
                            },
                        )?;
                        let _ = write_message(&mut stream, &error).await;
                        return Err(ErrorKind::AuthFailed);
                    }
                };
                let info: DeviceInfoPayload = first.parse_json()?;
                let their_nonce = info
                    .nonce
                    .clone()
                    .ok_or_else(|| ErrorKind::ProtocolError("missing nonce".to_string()))?;
                let our_nonce = new_nonce();
                let reply = Message::json(
                    MessageType::DeviceInfo,
                    first.request_id.clone(),
                    &self
                        .own_info(Some(our_nonce.clone()), Some(auth_proof(&secret, &their_nonce)))
                        .await?,
                )?;
                write_message(&mut stream, &reply).await?;

                let finish = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream))
                    .await
                    .map_err(|_| ErrorKind::Timeout)??
                    .ok_or(ErrorKind::PeerDisconnected)?;
                if finish.kind != MessageType::DeviceInfo {
                    return Err(ErrorKind::ProtocolError("expected DeviceInfo".to_string()));
                }
                let finish_info: DeviceInfoPayload = finish.parse_json()?;
                if finish_info.device_id != info.device_id
                    || !verify_proof(&secret, &our_nonce, finish_info.proof.as_deref())
                {
                    let error = Message::json(
                        MessageType::Error,
                        finish.request_id,
                        &ErrorPayload {
                            kind: ErrorKind::AuthFailed.kind().to_string(),
                            message: ErrorKind::AuthFailed.to_string(),
                        },
                    )?;
                    let _ = write_message(&mut stream, &error).await;
                    return Err(ErrorKind::AuthFailed);
                }
                self.register_session(stream, addr, info, false).await
            }
            _ => Err(ErrorKind::ProtocolError(
                "expected PairingRequest or DeviceInfoRequest".to_string(),
            )),
        }
    }

    async fn own_info(
        &self,
        nonce: Option<String>,
        proof: Option<String>,
    ) -> Result<DeviceInfoPayload> {
        let (device_id, device_name, device_type) = {
            let identity = self.identity.read().unwrap();
            (
                identity.device_id.clone(),
                identity.device_name.clone(),
                identity.device_type,
            )
        };
        let file_count: i64 =
            sqlx::query("SELECT COUNT(*) AS c FROM files WHERE source_device_id IS NULL")
                .fetch_one(self.store.pool())
                .await?
                .try_get("c")?;
        Ok(DeviceInfoPayload {
            version: PROTOCOL_VERSION,
            device_id,
            device_name,
            device_type,
            file_count,
            last_sync_timestamp: 0,
            nonce,
            proof,
        })
    }

    async fn register_session(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        info: DeviceInfoPayload,
        initiated_by_us: bool,
    ) -> Result<()> {
        let device_id = info.device_id.clone();
        let own_id = self.identity.read().unwrap().device_id.clone();
        // Simultaneous dial tie-break: the connection initiated by the
        // lexicographically smaller device id survives.
        if let Some(existing) = self.sessions.get(&device_id) {
            let keep_existing = if existing.initiated_by_us == initiated_by_us {
                true
            } else {
                let existing_dialer = if existing.initiated_by_us { &own_id } else { &device_id };
                let new_dialer = if initiated_by_us { &own_id } else { &device_id };
                existing_dialer <= new_dialer
            };
            if keep_existing {
                tracing::debug!("dropping duplicate session to {device_id}");
                return Ok(());
            }
            let stale = existing.value().clone();
            drop(existing);
            stale.cancel.cancel();
            self.sessions.remove(&device_id);
        }

        sqlx::query(
            "INSERT INTO devices (device_id, name, device_type, public_address, last_seen_at, trusted) \
             VALUES (?, ?, ?, ?, ?, 1) \
             ON CONFLICT (device_id) DO UPDATE SET name = excluded.name, \
             public_address = excluded.public_address, last_seen_at = excluded.last_seen_at, trusted = 1",
        )
        .bind(&device_id)
        .bind(&info.device_name)
        .bind(info.device_type as i64)
        .bind(addr.to_string())
        .bind(Timestamp::now().millis())
        .execute(self.store.pool())
        .await?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
        let cancel = CancellationToken::new();
        let handle = Arc::new(SessionHandle {
            device_id: device_id.clone(),
            peer: ConnectedPeer {
                device_id: device_id.clone(),
                device_name: info.device_name.clone(),
                device_type: info.device_type,
                address: addr.to_string(),
                file_count: info.file_count,
                last_sync_timestamp: info.last_sync_timestamp,
            },
            initiated_by_us,
            writer_tx,
            pending: Arc::new(DashMap::new()),
            cancel: cancel.clone(),
            last_inbound: Arc::new(StdMutex::new(Instant::now())),
        });
        self.sessions.insert(device_id.clone(), handle.clone());
        tracing::info!(target: "event", "device connected [id={device_id}] [addr={addr}]");
        self.events.send(EngineEvent::DeviceConnected(device_id.clone()));

        let (mut read_half, mut write_half) = stream.into_split();

        // writer: sole owner of the write half, preserves per-peer send order
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = writer_rx.recv() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    if write_message(&mut write_half, &message).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
            });
        }
        // heartbeat
        {
            let handle = handle.clone();
            let cancel = cancel.clone();
            let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    if handle.last_inbound.lock().unwrap().elapsed() > interval * 3 {
                        tracing::warn!("peer {} missed three heartbeats", handle.device_id);
                        cancel.cancel();
                        break;
                    }
                    let heartbeat = Message::new(MessageType::Heartbeat, new_request_id(), Vec::new());
                    if handle.writer_tx.send(heartbeat).await.is_err() {
                        break;
                    }
                }
            });
        }
        // reader
        {
            let service = self.clone();
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = read_message(&mut read_half) => frame,
                    };
                    match frame {
                        Ok(Some(message)) => {
                            *handle.last_inbound.lock().unwrap() = Instant::now();
                            service.route_inbound(&handle, message).await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(reason = %err, "session read error from {}", handle.device_id);
                            break;
                        }
                    }
                }
                cancel.cancel();
                service.teardown_session(&handle).await;
            });
        }
        Ok(())
    }

    async fn route_inbound(self: &Arc<Self>, handle: &Arc<SessionHandle>, message: Message) {
        match message.kind {
            MessageType::Heartbeat => {
                let ack = Message::new(MessageType::HeartbeatAck, message.request_id, Vec::new());
                let _ = handle.writer_tx.send(ack).await;
            }
            MessageType::Disconnect if message.request_id.is_empty() => {
                handle.cancel.cancel();
            }
            _ => {
                // registered slot wins; otherwise it is a new inbound request
                let stream_tx = handle.pending.get(&message.request_id).map(|slot| {
                    match slot.value() {
                        PendingSlot::Stream(tx) => Some(tx.clone()),
                        PendingSlot::Oneshot(_) => None,
                    }
                });
                match stream_tx {
                    Some(Some(tx)) => {
                        if tx.send(message).await.is_err() {
                            tracing::debug!("stream receiver dropped");
                        }
                    }
                    Some(None) => {
                        if let Some((_, PendingSlot::Oneshot(tx))) =
                            handle.pending.remove(&message.request_id)
                        {
                            let _ = tx.send(message);
                        }
                    }
                    None => {
                        // unsolicited acks for the liveness heartbeats
                        if message.kind == MessageType::HeartbeatAck {
                            return;
                        }
                        let inbound = InboundRequest {
                            device_id: handle.device_id.clone(),
                            message,
                        };
                        if self.inbound_tx.send(inbound).await.is_err() {
                            tracing::warn!("inbound dispatcher gone, dropping request");
                        }
                    }
                }
            }
        }
    }

    async fn teardown_session(self: &Arc<Self>, handle: &Arc<SessionHandle>) {
        let removed = self
            .sessions
            .remove_if(&handle.device_id, |_, current| {
                Arc::ptr_eq(current, handle)
            })
            .is_some();
        if !removed {
            return;
        }
        handle.pending.clear();
        tracing::info!(target: "event", "device disconnected [id={}]", handle.device_id);
        self.events
            .send(EngineEvent::DeviceDisconnected(handle.device_id.clone()));
        if self.running.load(Ordering::Acquire) {
            self.spawn_reconnect(handle.device_id.clone());
        }
    }

    /// Exponential backoff capped at 60 s, while the peer stays visible.
    fn spawn_reconnect(self: &Arc<Self>, device_id: String) {
        let service = self.clone();
        let Some(cancel) = self.net_cancel.lock().unwrap().clone() else {
            return;
        };
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                if service.sessions.contains_key(&device_id) {
                    break;
                }
                if let Some(endpoint) = service.discovery.peer_endpoint(&device_id) {
                    match service.connect_to_endpoint(endpoint, Some(&device_id)).await {
                        Ok(_) => break,
                        Err(err) => {
                            tracing::debug!(reason = %err, "reconnect to {device_id} failed");
                        }
                    }
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        });
    }

    /// Send a request and await its response by request id.
    pub async fn request(
        &self,
        device_id: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let handle = self
            .sessions
            .get(device_id)
            .map(|it| it.value().clone())
            .ok_or(ErrorKind::PeerDisconnected)?;
        let request_id = message.request_id.clone();
        let (tx, rx) = oneshot::channel();
        handle.pending.insert(request_id.clone(), PendingSlot::Oneshot(tx));
        if handle.writer_tx.send(message).await.is_err() {
            handle.pending.remove(&request_id);
            return Err(ErrorKind::PeerDisconnected);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ErrorKind::PeerDisconnected),
            Err(_) => {
                handle.pending.remove(&request_id);
                Err(ErrorKind::Timeout)
            }
        }
    }

    /// Send a request whose response is a stream of frames under the same
    /// request id (sync deltas, file chunks).
    pub async fn open_stream(
        &self,
        device_id: &str,
        message: Message,
        buffer: usize,
    ) -> Result<(String, mpsc::Receiver<Message>)> {
        let handle = self
            .sessions
            .get(device_id)
            .map(|it| it.value().clone())
            .ok_or(ErrorKind::PeerDisconnected)?;
        let request_id = message.request_id.clone();
        let (tx, rx) = mpsc::channel(buffer);
        handle.pending.insert(request_id.clone(), PendingSlot::Stream(tx));
        if handle.writer_tx.send(message).await.is_err() {
            handle.pending.remove(&request_id);
            return Err(ErrorKind::PeerDisconnected);
        }
        Ok((request_id, rx))
    }

    /// Responder side of a streamed exchange: receive frames (acks, cancels)
    /// for a request id we did not originate.
    pub fn register_stream(&self, device_id: &str, request_id: &str, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let handle = self
            .sessions
            .get(device_id)
            .map(|it| it.value().clone())
            .ok_or(ErrorKind::PeerDisconnected)?;
        let (tx, rx) = mpsc::channel(buffer);
        handle
            .pending
            .insert(request_id.to_string(), PendingSlot::Stream(tx));
        Ok(rx)
    }

    pub fn close_stream(&self, device_id: &str, request_id: &str) {
        if let Some(handle) = self.sessions.get(device_id) {
            handle.pending.remove(request_id);
        }
    }

    pub async fn send(&self, device_id: &str, message: Message) -> Result<()> {
        let handle = self
            .sessions
            .get(device_id)
            .map(|it| it.value().clone())
            .ok_or(ErrorKind::PeerDisconnected)?;
        handle
            .writer_tx
            .send(message)
            .await
            .map_err(|_| ErrorKind::PeerDisconnected)
    }

    pub async fn close_session(&self, device_id: &str) {
        if let Some(handle) = self.sessions.get(device_id).map(|it| it.value().clone()) {
            let goodbye = Message::new(MessageType::Disconnect, String::new(), Vec::new());
            let _ = handle.writer_tx.send(goodbye).await;
            handle.cancel.cancel();
        }
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    pub fn get_connected_devices(&self) -> Vec<ConnectedPeer> {
        self.sessions.iter().map(|it| it.peer.clone()).collect()
    }
}

fn new_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    to_hex(&bytes)
}

/// HMAC-SHA-256 over the peer's hex nonce string, keyed by the family secret.
fn auth_proof(secret: &[u8], nonce: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(nonce.as_bytes());
    to_hex(&mac.finalize().into_bytes())
}

fn verify_proof(secret: &[u8], nonce: &str, proof: Option<&str>) -> bool {
    let Some(proof) = proof.and_then(from_hex) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(nonce.as_bytes());
    mac.verify_slice(&proof).is_ok()
}

fn error_from_payload(message: &Message) -> ErrorKind {
    match message.parse_json::<ErrorPayload>() {
        Ok(payload) => ErrorKind::from_kind(&payload.kind)
            .unwrap_or(ErrorKind::ProtocolError(payload.message)),
        Err(_) => ErrorKind::ProtocolError("unreadable error payload".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::LocalIdentity;
    use std::sync::RwLock;

    #[test]
    fn proof_round_trip_and_tamper_detection() {
        let secret = vec![7u8; 32];
        let nonce = new_nonce();
        assert_eq!(nonce.len(), 64);
        let proof = auth_proof(&secret, &nonce);
        assert!(verify_proof(&secret, &nonce, Some(&proof)));
        assert!(!verify_proof(&secret, &nonce, None));
        assert!(!verify_proof(&[8u8; 32], &nonce, Some(&proof)));
        let other_nonce = new_nonce();
        assert!(!verify_proof(&secret, &other_nonce, Some(&proof)));
    }

    async fn node(name: &str, secret: Option<Vec<u8>>) -> Arc<SessionService> {
        let store = Store::open_in_memory().await.unwrap();
        let identity = Arc::new(RwLock::new(LocalIdentity {
            device_id: format!("{name}-0000-0000"),
            device_name: name.to_string(),
            device_type: 3,
            family_id: secret.as_ref().map(|_| "fam".to_string()),
            family_secret: secret,
        }));
        let events = Arc::new(EventBus::new());
        let config = NetworkConfig {
            tcp_port: 0,
            ..Default::default()
        };
        let discovery = Arc::new(DiscoveryService::new(
            config.clone(),
            identity.clone(),
            events.clone(),
        ));
        let pairing = Arc::new(PairingService::new(store.clone(), identity.clone()));
        let service = Arc::new(SessionService::new(
            store, config, identity, events, discovery, pairing,
        ));
        service.start(CancellationToken::new()).await.unwrap();
        service
    }

    #[tokio::test]
    async fn handshake_connects_and_routes_requests() {
        let secret = vec![42u8; 32];
        let host = node("alpha", Some(secret.clone())).await;
        let joiner = node("beta", Some(secret)).await;
        let addr = host.local_addr().unwrap();
        let host_id = joiner.connect_to_endpoint(addr, None).await.unwrap();
        assert_eq!(host_id, "alpha-0000-0000");
        // give the acceptor a beat to finish registration
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(host.is_connected("beta-0000-0000"));
        assert!(joiner.is_connected(&host_id));

        // heartbeat round trip exercises the correlation map
        let ping = Message::new(MessageType::Heartbeat, new_request_id(), Vec::new());
        let pong = joiner
            .request(&host_id, ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pong.kind, MessageType::HeartbeatAck);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let host = node("gamma", Some(vec![1u8; 32])).await;
        let joiner = node("delta", Some(vec![2u8; 32])).await;
        let addr = host.local_addr().unwrap();
        let err = joiner.connect_to_endpoint(addr, None).await.unwrap_err();
        assert!(matches!(err, ErrorKind::AuthFailed));
        assert!(!host.is_connected("delta-0000-0000"));
    }

    #[tokio::test]
    async fn session_loss_fails_pending_requests() {
        let secret = vec![9u8; 32];
        let host = node("echo", Some(secret.clone())).await;
        let joiner = node("foxtrot", Some(secret)).await;
        let addr = host.local_addr().unwrap();
        let host_id = joiner.connect_to_endpoint(addr, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // a request type nobody answers stays pending until the session dies
        let dangling = Message::json(
            MessageType::IndexSyncRequest,
            new_request_id(),
            &crate::protocol::IndexSyncRequestPayload {
                since_timestamp: 0,
                folder_ids: None,
                max_text_size_kb: 64,
            },
        )
        .unwrap();
        let joiner2 = joiner.clone();
        let host_id2 = host_id.clone();
        let pending = tokio::spawn(async move {
            joiner2
                .request(&host_id2, dangling, Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.stop().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ErrorKind::PeerDisconnected)));
    }
}
