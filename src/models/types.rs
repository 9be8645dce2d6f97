use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt::Display;

/// Unix milliseconds, stored as INTEGER, serialized as RFC 3339.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, sqlx::Type)]
#[sqlx(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }
    pub fn millis(&self) -> i64 {
        self.0
    }
    pub fn from_system_time(time: std::time::SystemTime) -> Self {
        Self(DateTime::<Utc>::from(time).timestamp_millis())
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
impl From<Timestamp> for i64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}
impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let dt = DateTime::<Utc>::from_timestamp_millis(self.0).unwrap_or_default();
        serializer.serialize_str(&dt.to_rfc3339())
    }
}
impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Family,
}

impl Visibility {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Visibility::Family,
            _ => Visibility::Private,
        }
    }
    pub fn as_i64(&self) -> i64 {
        match self {
            Visibility::Private => 0,
            Visibility::Family => 1,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Unknown,
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl ContentType {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ContentType::Image,
            2 => ContentType::Video,
            3 => ContentType::Audio,
            4 => ContentType::Document,
            5 => ContentType::Archive,
            6 => ContentType::Other,
            _ => ContentType::Unknown,
        }
    }
    pub fn as_i64(&self) -> i64 {
        match self {
            ContentType::Unknown => 0,
            ContentType::Image => 1,
            ContentType::Video => 2,
            ContentType::Audio => 3,
            ContentType::Document => 4,
            ContentType::Archive => 5,
            ContentType::Other => 6,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    User,
    Auto,
    Ai,
}

impl TagSource {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => TagSource::Auto,
            2 => TagSource::Ai,
            _ => TagSource::User,
        }
    }
    pub fn as_i64(&self) -> i64 {
        match self {
            TagSource::User => 0,
            TagSource::Auto => 1,
            TagSource::Ai => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_codec_is_stable() {
        for value in 0..=6 {
            assert_eq!(ContentType::from_i64(value).as_i64(), value);
        }
        assert_eq!(ContentType::from_i64(99), ContentType::Unknown);
    }

    #[test]
    fn timestamp_serializes_as_rfc3339() {
        let json = serde_json::to_string(&Timestamp::from(0)).unwrap();
        assert!(json.contains("1970-01-01"));
    }
}
