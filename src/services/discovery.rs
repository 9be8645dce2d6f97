use crate::config::NetworkConfig;
use crate::protocol::{DiscoveryPacket, PROTOCOL_VERSION};
use crate::services::events::{EngineEvent, EventBus, PeerSummary};
use crate::services::identity::IdentityHandle;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Peer {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub address: IpAddr,
    pub tcp_port: u16,
    pub family_id: Option<String>,
    pub last_seen: Instant,
    pub lost: bool,
}

/// UDP presence. Announces every `announce_interval_secs` to the broadcast
/// address and keeps a peer table from everything it hears back.
pub struct DiscoveryService {
    config: NetworkConfig,
    identity: IdentityHandle,
    events: Arc<EventBus>,
    peers: Arc<DashMap<String, Peer>>,
}

impl DiscoveryService {
    pub fn new(config: NetworkConfig, identity: IdentityHandle, events: Arc<EventBus>) -> Self {
        Self {
            config,
            identity,
            events,
            peers: Arc::new(DashMap::new()),
        }
    }

    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> crate::errors::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port))
            .await
            .map_err(crate::errors::ErrorKind::from)?;
        socket
            .set_broadcast(true)
            .map_err(crate::errors::ErrorKind::from)?;
        let socket = Arc::new(socket);
        tracing::info!("discovery listening on udp {}", self.config.discovery_port);

        let service = self.clone();
        let announce_to = SocketAddr::from(([255, 255, 255, 255], self.config.discovery_port));
        tokio::spawn(async move {
            let mut announce =
                tokio::time::interval(Duration::from_secs(service.config.announce_interval_secs));
            let mut sweep = tokio::time::interval(Duration::from_secs(5));
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = announce.tick() => {
                        let packet = service.own_packet();
                        match serde_json::to_vec(&packet) {
                            Ok(bytes) => {
                                if let Err(err) = socket.send_to(&bytes, announce_to).await {
                                    tracing::debug!(reason = %err, "discovery announce failed");
                                }
                            }
                            Err(err) => tracing::warn!(reason = %err, "failed to encode announcement"),
                        }
                    }
                    _ = sweep.tick() => service.sweep(),
                    received = socket.recv_from(&mut buf) => {
                        let (len, addr) = match received {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::debug!(reason = %err, "discovery recv failed");
                                continue;
                            }
                        };
                        match serde_json::from_slice::<DiscoveryPacket>(&buf[..len]) {
                            Ok(packet) => service.handle_packet(packet, addr.ip()),
                            Err(_) => tracing::trace!("ignoring malformed discovery packet from {addr}"),
                        }
                    }
                }
            }
            tracing::debug!("discovery stopped");
        });
        Ok(())
    }

    fn own_packet(&self) -> DiscoveryPacket {
        let identity = self.identity.read().unwrap();
        DiscoveryPacket {
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            device_type: identity.device_type,
            tcp_port: self.config.tcp_port,
            family_id: identity.family_id.clone(),
            proto: PROTOCOL_VERSION,
        }
    }

    pub fn handle_packet(&self, packet: DiscoveryPacket, address: IpAddr) {
        if packet.proto != PROTOCOL_VERSION {
            return;
        }
        let own_id = self.identity.read().unwrap().device_id.clone();
        if packet.device_id == own_id {
            return;
        }
        let device_id = packet.device_id.clone();
        let mut fresh = true;
        if let Some(mut existing) = self.peers.get_mut(&device_id) {
            fresh = existing.lost;
            existing.device_name = packet.device_name.clone();
            existing.device_type = packet.device_type;
            existing.address = address;
            existing.tcp_port = packet.tcp_port;
            existing.family_id = packet.family_id.clone();
            existing.last_seen = Instant::now();
            existing.lost = false;
        } else {
            self.peers.insert(
                device_id.clone(),
                Peer {
                    device_id: device_id.clone(),
                    device_name: packet.device_name.clone(),
                    device_type: packet.device_type,
                    address,
                    tcp_port: packet.tcp_port,
                    family_id: packet.family_id.clone(),
                    last_seen: Instant::now(),
                    lost: false,
                },
            );
        }
        if fresh {
            tracing::info!(target: "event", "device discovered [id={device_id}] [addr={address}]");
            self.events
                .send(EngineEvent::DeviceDiscovered(self.summarize(&device_id).unwrap()));
        }
    }

    /// Flag peers unseen for `peer_timeout_secs` as lost; drop entries that
    /// stayed lost ten times that long.
    pub fn sweep(&self) {
        let timeout = Duration::from_secs(self.config.peer_timeout_secs);
        let mut lost_ids = Vec::new();
        self.peers.retain(|id, peer| {
            let idle = peer.last_seen.elapsed();
            if idle > timeout * 10 {
                return false;
            }
            if !peer.lost && idle > timeout {
                peer.lost = true;
                lost_ids.push(id.clone());
            }
            true
        });
        for id in lost_ids {
            tracing::info!(target: "event", "device lost [id={id}]");
            self.events.send(EngineEvent::DeviceLost(id));
        }
    }

    fn summarize(&self, device_id: &str) -> Option<PeerSummary> {
        let own_family = self.identity.read().unwrap().family_id.clone();
        let peer = self.peers.get(device_id)?;
        Some(PeerSummary {
            device_id: peer.device_id.clone(),
            device_name: peer.device_name.clone(),
            device_type: peer.device_type,
            address: peer.address.to_string(),
            tcp_port: peer.tcp_port,
            family_id: peer.family_id.clone(),
            same_family: match (&own_family, &peer.family_id) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        })
    }

    pub fn get_discovered_devices(&self) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .filter(|entry| !entry.lost)
            .filter_map(|entry| self.summarize(entry.key()))
            .collect()
    }

    /// Dial target for a peer, if currently visible.
    pub fn peer_endpoint(&self, device_id: &str) -> Option<SocketAddr> {
        let peer = self.peers.get(device_id)?;
        if peer.lost {
            return None;
        }
        Some(SocketAddr::new(peer.address, peer.tcp_port))
    }

    /// Best-effort local address list; the routing trick needs no traffic.
    pub fn local_ip_addresses() -> Vec<String> {
        let mut addresses = Vec::new();
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(addr) = socket.local_addr() {
                    if !addr.ip().is_loopback() {
                        addresses.push(addr.ip().to_string());
                    }
                }
            }
        }
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::LocalIdentity;
    use std::sync::RwLock;

    fn service(family: Option<&str>) -> Arc<DiscoveryService> {
        let identity = Arc::new(RwLock::new(LocalIdentity {
            device_id: "self-id".into(),
            device_name: "self".into(),
            device_type: 3,
            family_id: family.map(|it| it.to_string()),
            family_secret: None,
        }));
        Arc::new(DiscoveryService::new(
            NetworkConfig::default(),
            identity,
            Arc::new(EventBus::new()),
        ))
    }

    fn packet(id: &str, family: Option<&str>) -> DiscoveryPacket {
        DiscoveryPacket {
            device_id: id.into(),
            device_name: format!("{id}-name"),
            device_type: 1,
            tcp_port: 47701,
            family_id: family.map(|it| it.to_string()),
            proto: PROTOCOL_VERSION,
        }
    }

    #[tokio::test]
    async fn peers_are_tracked_and_own_packets_ignored() {
        let service = service(Some("fam"));
        service.handle_packet(packet("self-id", None), "10.0.0.1".parse().unwrap());
        assert!(service.get_discovered_devices().is_empty());

        service.handle_packet(packet("peer-1", Some("fam")), "10.0.0.2".parse().unwrap());
        service.handle_packet(packet("peer-2", Some("other")), "10.0.0.3".parse().unwrap());
        let devices = service.get_discovered_devices();
        assert_eq!(devices.len(), 2);
        let peer1 = devices.iter().find(|d| d.device_id == "peer-1").unwrap();
        assert!(peer1.same_family);
        let peer2 = devices.iter().find(|d| d.device_id == "peer-2").unwrap();
        assert!(!peer2.same_family);
        assert_eq!(
            service.peer_endpoint("peer-1").unwrap(),
            "10.0.0.2:47701".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn stale_peers_are_marked_lost() {
        let service = service(None);
        service.handle_packet(packet("peer-1", None), "10.0.0.2".parse().unwrap());
        service
            .peers
            .get_mut("peer-1")
            .unwrap()
            .last_seen = Instant::now() - Duration::from_secs(31);
        let mut rx = service.events.subscribe();
        service.sweep();
        assert!(service.get_discovered_devices().is_empty());
        assert!(service.peer_endpoint("peer-1").is_none());
        match rx.try_recv() {
            Ok(EngineEvent::DeviceLost(id)) => assert_eq!(id, "peer-1"),
            other => panic!("expected DeviceLost, got {other:?}"),
        }
        // a fresh announcement resurrects the peer with a discovery event
        let mut rx = service.events.subscribe();
        service.handle_packet(packet("peer-1", None), "10.0.0.2".parse().unwrap());
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::DeviceDiscovered(_))));
    }

    #[tokio::test]
    async fn wrong_proto_is_ignored() {
        let service = service(None);
        let mut bad = packet("peer-9", None);
        bad.proto = 99;
        service.handle_packet(bad, "10.0.0.9".parse().unwrap());
        assert!(service.get_discovered_devices().is_empty());
    }
}
