//! Framed binary protocol spoken between paired devices.
//!
//! Compatibility note (protocol major version 1): the frame magic is
//! `0x48564C54` ("HVLT"), discovery runs on UDP port 47700 and sessions
//! default to TCP port 47701. Every frame is
//!
//! ```text
//! Magic(4, BE) | Length(4, BE, total incl. header) | Type(1)
//! | RequestIdLen(1) | RequestId(N <= 255, ASCII) | Payload
//! ```
//!
//! Control payloads are UTF-8 JSON; `FileChunk` payloads start with a fixed
//! 29-byte big-endian [`FileChunkHeader`] followed by raw bytes.

mod payloads;

pub use payloads::*;

use crate::errors::ErrorKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const PROTOCOL_MAGIC: u32 = 0x4856_4C54;
pub const PROTOCOL_VERSION: u8 = 1;
/// A full chunk plus its envelope must always fit, with headroom.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 + 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;
/// Magic + length + type + request-id length.
pub const FIXED_HEADER_LEN: usize = 10;
pub const FILE_CHUNK_HEADER_LEN: usize = 29;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    HeartbeatAck = 2,
    Disconnect = 3,
    Error = 4,
    DeviceInfoRequest = 5,
    DeviceInfo = 6,
    IndexSyncRequest = 7,
    IndexSyncResponse = 8,
    IndexDelta = 9,
    IndexDeltaAck = 10,
    FileRequest = 11,
    FileResponse = 12,
    FileChunk = 13,
    FileChunkAck = 14,
    FileNotFound = 15,
    SearchRequest = 16,
    SearchResponse = 17,
    PairingRequest = 18,
    PairingResponse = 19,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        Some(match value {
            1 => MessageType::Heartbeat,
            2 => MessageType::HeartbeatAck,
            3 => MessageType::Disconnect,
            4 => MessageType::Error,
            5 => MessageType::DeviceInfoRequest,
            6 => MessageType::DeviceInfo,
            7 => MessageType::IndexSyncRequest,
            8 => MessageType::IndexSyncResponse,
            9 => MessageType::IndexDelta,
            10 => MessageType::IndexDeltaAck,
            11 => MessageType::FileRequest,
            12 => MessageType::FileResponse,
            13 => MessageType::FileChunk,
            14 => MessageType::FileChunkAck,
            15 => MessageType::FileNotFound,
            16 => MessageType::SearchRequest,
            17 => MessageType::SearchResponse,
            18 => MessageType::PairingRequest,
            19 => MessageType::PairingResponse,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, request_id: impl Into<String>, payload: Vec<u8>) -> Message {
        let request_id = request_id.into();
        debug_assert!(request_id.len() <= 255 && request_id.is_ascii());
        Message {
            kind,
            request_id,
            payload,
        }
    }

    pub fn json<T: Serialize>(
        kind: MessageType,
        request_id: impl Into<String>,
        payload: &T,
    ) -> Result<Message, ErrorKind> {
        Ok(Message::new(kind, request_id, serde_json::to_vec(payload)?))
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ErrorKind> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = FIXED_HEADER_LEN + self.request_id.len() + self.payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.push(self.kind as u8);
        buf.push(self.request_id.len() as u8);
        buf.extend_from_slice(self.request_id.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from an exact buffer. `None` for wrong magic, bad
    /// declared length, unknown type or truncation; callers treat any `None`
    /// as grounds to reset the session.
    pub fn decode(buf: &[u8]) -> Option<Message> {
        if buf.len() < FIXED_HEADER_LEN {
            return None;
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        if magic != PROTOCOL_MAGIC {
            return None;
        }
        let length = u32::from_be_bytes(buf[4..8].try_into().ok()?) as usize;
        if length > MAX_MESSAGE_SIZE || length != buf.len() {
            return None;
        }
        let kind = MessageType::from_u8(buf[8])?;
        let id_len = buf[9] as usize;
        if FIXED_HEADER_LEN + id_len > length {
            return None;
        }
        let request_id =
            String::from_utf8(buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + id_len].to_vec()).ok()?;
        if !request_id.is_ascii() {
            return None;
        }
        let payload = buf[FIXED_HEADER_LEN + id_len..].to_vec();
        Some(Message {
            kind,
            request_id,
            payload,
        })
    }
}

/// Read one frame. `Ok(None)` is a clean EOF before any header byte;
/// malformed frames surface as `ProtocolError`.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ErrorKind>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; FIXED_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
    if magic != PROTOCOL_MAGIC {
        return Err(ErrorKind::ProtocolError("bad frame magic".to_string()));
    }
    let length = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    if !(FIXED_HEADER_LEN..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(ErrorKind::ProtocolError(format!(
            "frame length {length} out of bounds"
        )));
    }
    let mut rest = vec![0u8; length - FIXED_HEADER_LEN];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|_| ErrorKind::PeerDisconnected)?;
    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&rest);
    Message::decode(&buf)
        .map(Some)
        .ok_or_else(|| ErrorKind::ProtocolError("malformed frame".to_string()))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ErrorKind>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = message.encode();
    writer
        .write_all(&bytes)
        .await
        .map_err(|_| ErrorKind::PeerDisconnected)?;
    writer
        .flush()
        .await
        .map_err(|_| ErrorKind::PeerDisconnected)?;
    Ok(())
}

/// Fixed 29-byte prefix of every `FileChunk` payload, big-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileChunkHeader {
    pub file_id: u64,
    pub offset: u64,
    pub total_size: u64,
    pub chunk_size: u32,
    pub is_last: bool,
}

impl FileChunkHeader {
    pub fn encode(&self) -> [u8; FILE_CHUNK_HEADER_LEN] {
        let mut buf = [0u8; FILE_CHUNK_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.file_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.total_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.chunk_size.to_be_bytes());
        buf[28] = self.is_last as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<FileChunkHeader> {
        if buf.len() < FILE_CHUNK_HEADER_LEN {
            return None;
        }
        Some(FileChunkHeader {
            file_id: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            offset: u64::from_be_bytes(buf[8..16].try_into().ok()?),
            total_size: u64::from_be_bytes(buf[16..24].try_into().ok()?),
            chunk_size: u32::from_be_bytes(buf[24..28].try_into().ok()?),
            is_last: buf[28] != 0,
        })
    }
}

/// Build a chunk payload: header + raw bytes.
pub fn encode_chunk(header: &FileChunkHeader, bytes: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FILE_CHUNK_HEADER_LEN + bytes.len());
    payload.extend_from_slice(&header.encode());
    payload.extend_from_slice(bytes);
    payload
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            MessageType::IndexDelta,
            new_request_id(),
            br#"{"fileId":12}"#.to_vec(),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let message = sample();
        let bytes = message.encode();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xFF;
        assert!(Message::decode(&bytes).is_none());
    }

    #[test]
    fn random_prefixes_are_rejected() {
        let bytes: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
        assert!(Message::decode(&bytes).is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut bytes = sample().encode();
        let huge = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        bytes[4..8].copy_from_slice(&huge);
        assert!(Message::decode(&bytes).is_none());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = sample().encode();
        assert!(Message::decode(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = sample().encode();
        bytes[8] = 200;
        assert!(Message::decode(&bytes).is_none());
    }

    #[test]
    fn chunk_header_round_trip() {
        let header = FileChunkHeader {
            file_id: 42,
            offset: 1 << 33,
            total_size: (1 << 33) + 65536,
            chunk_size: 65536,
            is_last: true,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), FILE_CHUNK_HEADER_LEN);
        assert_eq!(FileChunkHeader::decode(&bytes).unwrap(), header);
        assert!(FileChunkHeader::decode(&bytes[..28]).is_none());
    }

    #[tokio::test]
    async fn stream_read_write_round_trip() {
        let message = sample();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_message(&mut client, &message).await.unwrap();
        let read = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(read, message);
        // clean EOF afterwards
        drop(client);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_bad_magic_is_protocol_error() {
        use tokio::io::AsyncWriteExt;
        let mut bytes = sample().encode();
        bytes[1] = 0;
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&bytes).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(ErrorKind::ProtocolError(_))
        ));
    }

    #[test]
    fn request_ids_are_uuid_shaped() {
        let id = new_request_id();
        assert_eq!(id.len(), 36);
        assert!(id.is_ascii());
    }
}
