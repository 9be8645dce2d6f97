mod device_config;
mod logs_config;
mod network_config;
mod storage_config;

pub use device_config::DeviceConfig;
pub use logs_config::LogsConfig;
pub use network_config::NetworkConfig;
pub use storage_config::StorageConfig;

use anyhow::{Context, anyhow};
use std::path::PathBuf;
use std::sync::LazyLock;

static ROOT_DIR: LazyLock<PathBuf> = LazyLock::new(|| std::env::current_dir().unwrap());

pub(crate) fn root_dir() -> &'static PathBuf {
    &ROOT_DIR
}

#[derive(serde::Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub logs: LogsConfig,
}

impl Config {
    pub fn from_config_file() -> anyhow::Result<Self> {
        let path = Config::parse_config_file_path()?;
        if !path.is_file() {
            return Err(anyhow!(
                "Error: Configuration file not found or invalid.\n\
        Please make sure that the configuration file exists and is a valid TOML file.\n\
        Expected file path: {:?}",
                path
            ));
        }
        let content = std::fs::read_to_string(path).with_context(|| {
            "Error: Failed to read configuration file.\n\
        Please check the file path and file permissions, and make sure the file is valid accessible"
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).with_context(|| {
            "Error: Failed to parse configuration file.\n\
        Please check the file syntax is valid TOML syntax"
        })
    }

    fn parse_config_file_path() -> anyhow::Result<PathBuf> {
        let mut args = std::env::args();
        args.next();
        while let Some(arg) = args.next() {
            if arg == "-c" || arg == "--config" {
                if let Some(path) = args.next() {
                    return Ok(std::path::Path::new(&path).to_path_buf());
                } else {
                    anyhow::bail!("Error: Please specify path string for -c argument.")
                }
            }
        }
        anyhow::bail!("Error: Please specify configuration file argument. Usage: -c <config_file>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = Config::from_toml(
            r#"
            [storage]
            data_path = "/tmp/hearthvault"
            "#,
        )
        .unwrap();
        assert_eq!(config.network.tcp_port, 47701);
        assert_eq!(config.network.discovery_port, 47700);
        assert_eq!(config.storage.data_path, "/tmp/hearthvault");
        assert!(config.storage.cache_cap_bytes > 0);
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(Config::from_toml("storage = ][").is_err());
    }
}
