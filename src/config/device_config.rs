use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// 0 unknown, 1 phone, 2 tablet, 3 desktop, 4 laptop
    #[serde(default)]
    pub device_type: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            device_type: 0,
        }
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "hearthvault".to_string())
}
