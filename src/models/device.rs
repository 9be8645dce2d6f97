use crate::models::Timestamp;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub device_type: u8,
    pub public_address: Option<String>,
    pub last_seen_at: Option<Timestamp>,
    pub trusted: bool,
    pub last_sync_at: Timestamp,
}

impl Device {
    pub const COLUMNS: &'static str =
        "device_id, name, device_type, public_address, last_seen_at, trusted, last_sync_at";

    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            device_id: row.try_get("device_id")?,
            name: row.try_get("name")?,
            device_type: row.try_get::<i64, _>("device_type")? as u8,
            public_address: row.try_get("public_address")?,
            last_seen_at: row
                .try_get::<Option<i64>, _>("last_seen_at")?
                .map(Timestamp::from),
            trusted: row.try_get::<i64, _>("trusted")? != 0,
            last_sync_at: row.try_get::<i64, _>("last_sync_at")?.into(),
        })
    }
}

/// The single `family_config` row. `family_secret` is the 32-byte symmetric
/// root authenticator; it never leaves the store except through pairing.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub family_id: String,
    pub family_secret: Vec<u8>,
    pub device_id: String,
    pub device_name: String,
    pub created_at: Timestamp,
}

impl FamilyConfig {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            family_id: row.try_get("family_id")?,
            family_secret: row.try_get("family_secret")?,
            device_id: row.try_get("device_id")?,
            device_name: row.try_get("device_name")?,
            created_at: row.try_get::<i64, _>("created_at")?.into(),
        })
    }
}
