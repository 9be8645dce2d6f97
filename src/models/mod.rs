mod device;
mod file;
mod folder;
mod tag;
mod types;

pub use device::{Device, FamilyConfig};
pub use file::{FileRecord, ImageMetadata, IndexStats};
pub use folder::WatchedFolder;
pub use tag::Tag;
pub use types::{ContentType, TagSource, Timestamp, Visibility};
