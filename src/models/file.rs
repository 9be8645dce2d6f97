use crate::models::{ContentType, Timestamp, Visibility};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: i64,
    pub folder_id: Option<i64>,
    pub relative_path: Option<String>,
    pub name: String,
    pub extension: String,
    pub size: i64,
    pub mime_type: String,
    pub content_type: ContentType,
    pub checksum: Option<String>,
    pub created_at: Option<Timestamp>,
    pub modified_at: Timestamp,
    pub indexed_at: Timestamp,
    pub visibility: Visibility,
    pub source_device_id: Option<String>,
    pub remote_file_id: Option<i64>,
    pub sync_version: i64,
    pub last_modified_by: Option<String>,
}

impl FileRecord {
    pub const COLUMNS: &'static str = "id, folder_id, relative_path, name, extension, size, \
         mimetype, content_type, checksum, created_at, modified_at, indexed_at, visibility, \
         source_device_id, remote_file_id, sync_version, last_modified_by";

    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            folder_id: row.try_get("folder_id")?,
            relative_path: row.try_get("relative_path")?,
            name: row.try_get("name")?,
            extension: row.try_get("extension")?,
            size: row.try_get("size")?,
            mime_type: row.try_get("mimetype")?,
            content_type: ContentType::from_i64(row.try_get("content_type")?),
            checksum: row.try_get("checksum")?,
            created_at: row
                .try_get::<Option<i64>, _>("created_at")?
                .map(Timestamp::from),
            modified_at: row.try_get::<i64, _>("modified_at")?.into(),
            indexed_at: row.try_get::<i64, _>("indexed_at")?.into(),
            visibility: Visibility::from_i64(row.try_get("visibility")?),
            source_device_id: row.try_get("source_device_id")?,
            remote_file_id: row.try_get("remote_file_id")?,
            sync_version: row.try_get("sync_version")?,
            last_modified_by: row.try_get("last_modified_by")?,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.source_device_id.is_some()
    }
}

/// Per-content-type index totals reported by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_files: i64,
    pub total_size: i64,
    pub folder_count: i64,
    pub image: i64,
    pub video: i64,
    pub audio: i64,
    pub document: i64,
    pub archive: i64,
    pub other: i64,
    pub unknown: i64,
}

impl IndexStats {
    pub fn bump(&mut self, content_type: ContentType, count: i64) {
        match content_type {
            ContentType::Image => self.image += count,
            ContentType::Video => self.video += count,
            ContentType::Audio => self.audio += count,
            ContentType::Document => self.document += count,
            ContentType::Archive => self.archive += count,
            ContentType::Other => self.other += count,
            ContentType::Unknown => self.unknown += count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub file_id: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub taken_at: Option<Timestamp>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub orientation: Option<i64>,
}
