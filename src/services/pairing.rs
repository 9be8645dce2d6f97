use crate::errors::{ErrorKind, Result};
use crate::models::Timestamp;
use crate::protocol::{
    Message, MessageType, PairingRequestPayload, PairingResponsePayload, new_request_id,
    read_message, write_message,
};
use crate::services::identity::IdentityHandle;
use crate::store::Store;
use crate::utils::{from_hex, to_hex};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const PIN_TTL: Duration = Duration::from_secs(300);
const LOCKOUT: Duration = Duration::from_secs(300);
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAILURES: usize = 3;
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

struct PinSession {
    pin: String,
    expires_at: Instant,
}

/// PIN issuance on the host, PIN-authenticated join on the joiner. Success
/// seals the 32-byte family secret on both sides.
pub struct PairingService {
    store: Store,
    identity: IdentityHandle,
    pin_session: Mutex<Option<PinSession>>,
    failures: Mutex<VecDeque<Instant>>,
    locked_until: Mutex<Option<Instant>>,
    join_attempt: Mutex<Option<CancellationToken>>,
}

impl PairingService {
    pub fn new(store: Store, identity: IdentityHandle) -> Self {
        Self {
            store,
            identity,
            pin_session: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            locked_until: Mutex::new(None),
            join_attempt: Mutex::new(None),
        }
    }

    pub fn is_family_configured(&self) -> bool {
        self.identity.read().unwrap().family_secret.is_some()
    }

    /// Become the first device of a new family.
    pub async fn create_family(&self) -> Result<()> {
        if self.is_family_configured() {
            return Err(ErrorKind::AlreadyExists("family".to_string()));
        }
        let family_id = uuid::Uuid::new_v4().to_string();
        let mut secret = vec![0u8; 32];
        rand::rng().fill(secret.as_mut_slice());
        let (device_id, device_name) = {
            let identity = self.identity.read().unwrap();
            (identity.device_id.clone(), identity.device_name.clone())
        };
        sqlx::query(
            "INSERT INTO family_config (id, family_id, family_secret, device_id, device_name, created_at) \
             VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(&family_id)
        .bind(&secret)
        .bind(&device_id)
        .bind(&device_name)
        .bind(Timestamp::now().millis())
        .execute(self.store.pool())
        .await?;
        {
            let mut identity = self.identity.write().unwrap();
            identity.family_id = Some(family_id.clone());
            identity.family_secret = Some(secret);
        }
        tracing::info!(target: "event", "family created [id={family_id}]");
        Ok(())
    }

    /// Install a fresh 6-digit PIN with a 5-minute TTL. One open session per
    /// node; regenerating replaces it.
    pub fn regenerate_pin(&self) -> Result<String> {
        if !self.is_family_configured() {
            return Err(ErrorKind::NotFound);
        }
        let pin: u32 = rand::rng().random_range(0..=999_999);
        let pin = format!("{:06}", pin);
        *self.pin_session.lock().unwrap() = Some(PinSession {
            pin: pin.clone(),
            expires_at: Instant::now() + PIN_TTL,
        });
        tracing::info!(target: "event", "pairing pin regenerated");
        Ok(pin)
    }

    fn locked(&self) -> bool {
        let guard = self.locked_until.lock().unwrap();
        matches!(*guard, Some(until) if until > Instant::now())
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut failures = self.failures.lock().unwrap();
        failures.push_back(now);
        while let Some(first) = failures.front() {
            if now.duration_since(*first) > FAILURE_WINDOW {
                failures.pop_front();
            } else {
                break;
            }
        }
        if failures.len() >= MAX_FAILURES {
            failures.clear();
            *self.locked_until.lock().unwrap() = Some(now + LOCKOUT);
            tracing::warn!("pairing locked after repeated PIN failures");
        }
    }

    /// Host side. Never errors; the outcome is always a wire response.
    pub async fn handle_pairing_request(
        &self,
        request: &PairingRequestPayload,
    ) -> PairingResponsePayload {
        let failure = |kind: &ErrorKind| PairingResponsePayload {
            success: false,
            family_id: None,
            family_secret: None,
            device_id: None,
            device_name: None,
            error_kind: Some(kind.kind().to_string()),
        };
        if self.locked() {
            return failure(&ErrorKind::Locked);
        }
        let pin_ok = {
            let session = self.pin_session.lock().unwrap();
            match session.as_ref() {
                None => return failure(&ErrorKind::PinExpired),
                Some(session) if session.expires_at < Instant::now() => {
                    return failure(&ErrorKind::PinExpired);
                }
                Some(session) => constant_time_eq(&session.pin, &request.pin),
            }
        };
        if !pin_ok {
            self.record_failure();
            tracing::warn!("pairing attempt with wrong PIN from {}", request.device_id);
            return failure(&ErrorKind::PinInvalid);
        }
        let (family_id, secret, device_id, device_name) = {
            let identity = self.identity.read().unwrap();
            match (&identity.family_id, &identity.family_secret) {
                (Some(family_id), Some(secret)) => (
                    family_id.clone(),
                    secret.clone(),
                    identity.device_id.clone(),
                    identity.device_name.clone(),
                ),
                _ => return failure(&ErrorKind::NotFound),
            }
        };
        if let Err(err) = self
            .trust_device(&request.device_id, &request.device_name, request.device_type)
            .await
        {
            tracing::error!(reason = %err, "failed to persist paired device");
            return failure(&err);
        }
        // single-use: a successful join closes the session
        *self.pin_session.lock().unwrap() = None;
        tracing::info!(target: "event", "device paired [id={}] [name={}]", request.device_id, request.device_name);
        PairingResponsePayload {
            success: true,
            family_id: Some(family_id),
            family_secret: Some(to_hex(&secret)),
            device_id: Some(device_id),
            device_name: Some(device_name),
            error_kind: None,
        }
    }

    async fn trust_device(&self, device_id: &str, name: &str, device_type: u8) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_id, name, device_type, last_seen_at, trusted) \
             VALUES (?, ?, ?, ?, 1) \
             ON CONFLICT (device_id) DO UPDATE SET name = excluded.name, \
             device_type = excluded.device_type, trusted = 1, last_seen_at = excluded.last_seen_at",
        )
        .bind(device_id)
        .bind(name)
        .bind(device_type as i64)
        .bind(Timestamp::now().millis())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Joiner side: dial the host, present the PIN, seal the secret.
    pub async fn join_family_by_pin(&self, pin: &str, host: &str, port: u16) -> Result<()> {
        if self.is_family_configured() {
            return Err(ErrorKind::AlreadyExists("family".to_string()));
        }
        let cancel = CancellationToken::new();
        *self.join_attempt.lock().unwrap() = Some(cancel.clone());
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ErrorKind::Cancelled),
            outcome = self.join_inner(pin, host, port) => outcome,
        };
        *self.join_attempt.lock().unwrap() = None;
        result
    }

    async fn join_inner(&self, pin: &str, host: &str, port: u16) -> Result<()> {
        let (device_id, device_name, device_type) = {
            let identity = self.identity.read().unwrap();
            (
                identity.device_id.clone(),
                identity.device_name.clone(),
                identity.device_type,
            )
        };
        let mut stream = tokio::time::timeout(
            JOIN_TIMEOUT,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| ErrorKind::Timeout)?
        .map_err(|_| ErrorKind::PeerDisconnected)?;

        let request_id = new_request_id();
        let request = Message::json(
            MessageType::PairingRequest,
            request_id.clone(),
            &PairingRequestPayload {
                pin: pin.to_string(),
                device_id,
                device_name,
                device_type,
            },
        )?;
        write_message(&mut stream, &request).await?;

        let response = tokio::time::timeout(JOIN_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| ErrorKind::Timeout)??
            .ok_or(ErrorKind::PeerDisconnected)?;
        if response.kind != MessageType::PairingResponse || response.request_id != request_id {
            return Err(ErrorKind::ProtocolError(
                "unexpected reply to pairing request".to_string(),
            ));
        }
        let payload: PairingResponsePayload = response.parse_json()?;
        if !payload.success {
            let kind = payload.error_kind.as_deref().unwrap_or("");
            return Err(ErrorKind::from_kind(kind)
                .unwrap_or_else(|| ErrorKind::ProtocolError(format!("pairing failed: {kind}"))));
        }
        let family_id = payload
            .family_id
            .ok_or_else(|| ErrorKind::ProtocolError("missing family id".to_string()))?;
        let secret = payload
            .family_secret
            .as_deref()
            .and_then(from_hex)
            .filter(|it| it.len() == 32)
            .ok_or_else(|| ErrorKind::ProtocolError("missing family secret".to_string()))?;
        let host_device_id = payload
            .device_id
            .ok_or_else(|| ErrorKind::ProtocolError("missing host device id".to_string()))?;
        let host_device_name = payload.device_name.unwrap_or_else(|| host.to_string());

        let (our_id, our_name) = {
            let identity = self.identity.read().unwrap();
            (identity.device_id.clone(), identity.device_name.clone())
        };
        sqlx::query(
            "INSERT INTO family_config (id, family_id, family_secret, device_id, device_name, created_at) \
             VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(&family_id)
        .bind(&secret)
        .bind(&our_id)
        .bind(&our_name)
        .bind(Timestamp::now().millis())
        .execute(self.store.pool())
        .await?;
        self.trust_device(&host_device_id, &host_device_name, 0).await?;
        {
            let mut identity = self.identity.write().unwrap();
            identity.family_id = Some(family_id.clone());
            identity.family_secret = Some(secret);
        }
        tracing::info!(target: "event", "joined family [id={family_id}] [host={host_device_id}]");
        Ok(())
    }

    pub async fn join_family_by_qr(&self, qr: &str) -> Result<()> {
        let (host, port, pin) =
            parse_pairing_uri(qr).ok_or_else(|| ErrorKind::ProtocolError("invalid QR".to_string()))?;
        self.join_family_by_pin(&pin, &host, port).await
    }

    pub fn cancel_pairing(&self) {
        if let Some(token) = self.join_attempt.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// `fv://pair?host=H&port=P&pin=NNNNNN` for the host's QR code.
    pub fn pairing_uri(&self, host: &str, port: u16, pin: &str) -> String {
        format!("fv://pair?host={host}&port={port}&pin={pin}")
    }
}

pub fn parse_pairing_uri(value: &str) -> Option<(String, u16, String)> {
    let query = value.strip_prefix("fv://pair?")?;
    let mut host = None;
    let mut port = None;
    let mut pin = None;
    for pair in query.split('&') {
        let (key, val) = pair.split_once('=')?;
        match key {
            "host" => host = Some(val.to_string()),
            "port" => port = val.parse::<u16>().ok(),
            "pin" => pin = Some(val.to_string()),
            _ => {}
        }
    }
    match (host, port, pin) {
        (Some(host), Some(port), Some(pin)) if pin.len() == 6 => Some((host, port, pin)),
        _ => None,
    }
}

/// Timing-safe string compare via HMAC under a fixed key.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let key = b"hearthvault.pin.compare.v1";
    let mut left = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    left.update(a.as_bytes());
    let mut right = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    right.update(b.as_bytes());
    left.verify_slice(&right.finalize().into_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity;

    async fn host_service() -> PairingService {
        let store = Store::open_in_memory().await.unwrap();
        let identity = identity::load_or_create(&store, &crate::config::DeviceConfig::default())
            .await
            .unwrap();
        let service = PairingService::new(store, identity);
        service.create_family().await.unwrap();
        service
    }

    fn request(pin: &str) -> PairingRequestPayload {
        PairingRequestPayload {
            pin: pin.to_string(),
            device_id: "joiner-1".into(),
            device_name: "tablet".into(),
            device_type: 2,
        }
    }

    #[tokio::test]
    async fn create_family_is_single_shot() {
        let service = host_service().await;
        assert!(service.is_family_configured());
        assert!(matches!(
            service.create_family().await,
            Err(ErrorKind::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn correct_pin_returns_secret_and_trusts_device() {
        let service = host_service().await;
        let pin = service.regenerate_pin().unwrap();
        assert_eq!(pin.len(), 6);
        let response = service.handle_pairing_request(&request(&pin)).await;
        assert!(response.success);
        let secret = from_hex(response.family_secret.as_deref().unwrap()).unwrap();
        assert_eq!(secret.len(), 32);
        let row = sqlx::query("SELECT trusted FROM devices WHERE device_id = 'joiner-1'")
            .fetch_one(service.store.pool())
            .await
            .unwrap();
        use sqlx::Row;
        assert_eq!(row.try_get::<i64, _>("trusted").unwrap(), 1);
        // the session is single-use
        let again = service.handle_pairing_request(&request(&pin)).await;
        assert_eq!(again.error_kind.as_deref(), Some("PIN_EXPIRED"));
    }

    #[tokio::test]
    async fn repeated_failures_lock_pairing() {
        let service = host_service().await;
        let _pin = service.regenerate_pin().unwrap();
        for _ in 0..3 {
            let response = service.handle_pairing_request(&request("000000")).await;
            assert_eq!(response.error_kind.as_deref(), Some("PIN_INVALID"));
        }
        // fourth and later attempts are locked out, even with the right pin
        let response = service.handle_pairing_request(&request("000000")).await;
        assert_eq!(response.error_kind.as_deref(), Some("LOCKED"));
    }

    #[tokio::test]
    async fn expired_pin_is_rejected() {
        let service = host_service().await;
        let pin = service.regenerate_pin().unwrap();
        service.pin_session.lock().unwrap().as_mut().unwrap().expires_at =
            Instant::now() - Duration::from_secs(1);
        let response = service.handle_pairing_request(&request(&pin)).await;
        assert_eq!(response.error_kind.as_deref(), Some("PIN_EXPIRED"));
    }

    #[test]
    fn qr_uri_round_trip() {
        let uri = "fv://pair?host=192.168.1.20&port=47701&pin=482193";
        let (host, port, pin) = parse_pairing_uri(uri).unwrap();
        assert_eq!(host, "192.168.1.20");
        assert_eq!(port, 47701);
        assert_eq!(pin, "482193");
        assert!(parse_pairing_uri("http://pair?host=x&port=1&pin=123456").is_none());
        assert!(parse_pairing_uri("fv://pair?host=x&port=1&pin=12").is_none());
    }

    #[test]
    fn constant_time_compare_behaves() {
        assert!(constant_time_eq("482193", "482193"));
        assert!(!constant_time_eq("482193", "482194"));
        assert!(!constant_time_eq("482193", "48219"));
    }
}
