use serde::{Deserialize, Serialize};

/// Discovery announcement, broadcast as bare JSON over UDP (no frame).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPacket {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub tcp_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    pub proto: u8,
}

/// Carried by `DeviceInfoRequest` (handshake leg 1) and `DeviceInfo`
/// (legs 2 and 3). `nonce` challenges the receiver; `proof` is the hex
/// HMAC-SHA-256 of the other side's nonce under the family secret.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoPayload {
    pub version: u8,
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub file_count: i64,
    pub last_sync_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestPayload {
    pub pin: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponsePayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Hex-encoded 32-byte family secret; present only on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexSyncRequestPayload {
    pub since_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_ids: Option<Vec<i64>>,
    /// Receiver's extracted-text budget; the sender truncates to honor it.
    pub max_text_size_kb: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexSyncResponsePayload {
    pub delta_count: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexDeltaPayload {
    pub file_id: i64,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub is_deleted: bool,
    pub device_id: String,
    pub sync_version: i64,
    pub sync_timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexDeltaAckPayload {
    pub file_ids: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileRequestPayload {
    pub file_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Resume point; 0 for a fresh transfer.
    pub offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileResponsePayload {
    pub file_id: i64,
    pub name: String,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileNotFoundPayload {
    pub file_id: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkAckPayload {
    pub offset: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequestPayload {
    pub query: crate::services::SearchQuery,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponsePayload {
    pub results: Vec<RemoteSearchHit>,
}

/// Trimmed result row for cross-device search responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSearchHit {
    pub file_id: i64,
    pub name: String,
    pub path: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_packet_uses_wire_field_names() {
        let packet = DiscoveryPacket {
            device_id: "6f2d".into(),
            device_name: "kitchen".into(),
            device_type: 3,
            tcp_port: 47701,
            family_id: Some("fam".into()),
            proto: 1,
        };
        let json = serde_json::to_string(&packet).unwrap();
        for field in ["deviceId", "deviceName", "deviceType", "tcpPort", "familyId", "proto"] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
        let back: DiscoveryPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn delta_round_trip_preserves_tombstones() {
        let delta = IndexDeltaPayload {
            file_id: 7,
            path: "a/b.txt".into(),
            name: "b.txt".into(),
            mime_type: "text/plain".into(),
            size: 0,
            modified_at: 1234,
            checksum: None,
            extracted_text: None,
            is_deleted: true,
            device_id: "dev".into(),
            sync_version: 3,
            sync_timestamp: 1235,
        };
        let bytes = serde_json::to_vec(&delta).unwrap();
        let back: IndexDeltaPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, delta);
    }
}
