use crate::config::root_dir;
use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StorageConfig {
    /// Directory holding the database file.
    pub data_path: String,
    /// Directory holding the remote-file cache. Defaults to `<data>/cache`.
    pub cache_path: Option<String>,
    #[serde(default = "default_cache_cap")]
    pub cache_cap_bytes: u64,
    /// Upper bound for text extracted into the search index, per file.
    #[serde(default = "default_max_text_size_kb")]
    pub max_text_size_kb: u32,
}

impl StorageConfig {
    pub fn parse_data_dir(&self) -> anyhow::Result<PathBuf> {
        resolve(&self.data_path).with_context(|| "Failed to parse storage directory.".to_string())
    }

    pub fn parse_cache_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.cache_path {
            Some(path) => {
                resolve(path).with_context(|| "Failed to parse cache directory.".to_string())
            }
            None => Ok(self.parse_data_dir()?.join("cache")),
        }
    }

    pub fn max_text_size_bytes(&self) -> usize {
        self.max_text_size_kb as usize * 1024
    }
}

fn resolve(raw: &str) -> anyhow::Result<PathBuf> {
    let path = std::path::Path::new(raw).to_path_buf();
    let path = if path.is_absolute() {
        path
    } else {
        root_dir().join(path)
    };
    if !path.exists() {
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory {path:?}"))?;
    }
    Ok(path)
}

fn default_cache_cap() -> u64 {
    512 * 1024 * 1024
}

fn default_max_text_size_kb() -> u32 {
    256
}
