use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Idle timeout between file chunks; transfers tolerate slower media.
    #[serde(default = "default_transfer_idle_timeout")]
    pub transfer_idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_tcp_port(),
            discovery_port: default_discovery_port(),
            announce_interval_secs: default_announce_interval(),
            peer_timeout_secs: default_peer_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            transfer_idle_timeout_secs: default_transfer_idle_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    47701
}
fn default_discovery_port() -> u16 {
    47700
}
fn default_announce_interval() -> u64 {
    5
}
fn default_peer_timeout() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    30
}
fn default_transfer_idle_timeout() -> u64 {
    60
}
