use crate::models::{Timestamp, Visibility};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedFolder {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub visibility: Visibility,
    pub enabled: bool,
    pub last_scan_at: Option<Timestamp>,
    pub file_count: i64,
    pub total_size: i64,
}

impl WatchedFolder {
    pub const COLUMNS: &'static str =
        "id, path, name, visibility, enabled, last_scan_at, file_count, total_size";

    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            name: row.try_get("name")?,
            visibility: Visibility::from_i64(row.try_get("visibility")?),
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            last_scan_at: row
                .try_get::<Option<i64>, _>("last_scan_at")?
                .map(Timestamp::from),
            file_count: row.try_get("file_count")?,
            total_size: row.try_get("total_size")?,
        })
    }
}
