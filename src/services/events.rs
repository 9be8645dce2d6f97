use crate::errors::ErrorKind;
use serde::Serialize;
use tokio::sync::broadcast;

/// Single broadcast stream every shell subscribes to. Events serialize as
/// `{"type": "...", "payload": ...}`.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { sender: tx }
    }

    pub fn send(&self, event: EngineEvent) {
        // No receivers is not an error; shells attach late.
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(err) = self.sender.send(event) {
            tracing::warn!(
                "{}",
                crate::errors::InternalError::BroadcastEventError(err.to_string())
            );
        }
    }

    pub fn error(&self, err: &ErrorKind) {
        self.send(EngineEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Stream view for shells; slow subscribers that lag simply skip ahead.
    pub fn subscribe_stream(&self) -> impl futures::Stream<Item = EngineEvent> + use<> {
        use futures::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.sender.subscribe())
            .filter_map(|event| async move { event.ok() })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub address: String,
    pub tcp_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    pub same_family: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgressPayload {
    pub folder_id: i64,
    pub total: u64,
    pub processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressPayload {
    pub request_id: String,
    pub device_id: String,
    pub file_id: i64,
    pub received: u64,
    pub total: u64,
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    DeviceDiscovered(PeerSummary),
    DeviceLost(String),
    DeviceConnected(String),
    DeviceDisconnected(String),
    FileTransferProgress(TransferProgressPayload),
    FileTransferComplete {
        request_id: String,
        file_id: i64,
        path: String,
    },
    FileTransferError {
        request_id: String,
        kind: String,
        resumable: bool,
    },
    IndexChanged,
    ScanProgress(ScanProgressPayload),
    Error {
        kind: String,
        message: String,
    },
}

impl EngineEvent {
    pub fn to_json(&self) -> String {
        let (kind, payload) = match self {
            EngineEvent::DeviceDiscovered(peer) => (
                "DEVICE_DISCOVERED",
                serde_json::to_value(peer).unwrap_or_default(),
            ),
            EngineEvent::DeviceLost(id) => ("DEVICE_LOST", serde_json::json!(id)),
            EngineEvent::DeviceConnected(id) => ("DEVICE_CONNECTED", serde_json::json!(id)),
            EngineEvent::DeviceDisconnected(id) => ("DEVICE_DISCONNECTED", serde_json::json!(id)),
            EngineEvent::FileTransferProgress(progress) => (
                "FILE_TRANSFER_PROGRESS",
                serde_json::to_value(progress).unwrap_or_default(),
            ),
            EngineEvent::FileTransferComplete {
                request_id,
                file_id,
                path,
            } => (
                "FILE_TRANSFER_COMPLETE",
                serde_json::json!({
                    "requestId": request_id,
                    "fileId": file_id,
                    "path": path,
                }),
            ),
            EngineEvent::FileTransferError {
                request_id,
                kind,
                resumable,
            } => (
                "FILE_TRANSFER_ERROR",
                serde_json::json!({
                    "requestId": request_id,
                    "kind": kind,
                    "resumable": resumable,
                }),
            ),
            EngineEvent::IndexChanged => ("INDEX_CHANGED", serde_json::Value::Null),
            EngineEvent::ScanProgress(progress) => (
                "SCAN_PROGRESS",
                serde_json::to_value(progress).unwrap_or_default(),
            ),
            EngineEvent::Error { kind, message } => (
                "ERROR",
                serde_json::json!({ "kind": kind, "message": message }),
            ),
        };
        serde_json::json!({
            "type": kind,
            "payload": payload
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.send(EngineEvent::IndexChanged);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.to_json(), r#"{"payload":null,"type":"INDEX_CHANGED"}"#);
    }

    #[tokio::test]
    async fn stream_subscription_yields_events() {
        use futures::StreamExt;
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_stream());
        bus.send(EngineEvent::IndexChanged);
        let event = stream.next().await.unwrap();
        assert!(matches!(event, EngineEvent::IndexChanged));
    }

    #[test]
    fn event_json_shape() {
        let json = EngineEvent::DeviceLost("abc".into()).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "DEVICE_LOST");
        assert_eq!(value["payload"], "abc");
    }
}
