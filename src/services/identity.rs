use crate::config::DeviceConfig;
use crate::errors::Result;
use crate::models::FamilyConfig;
use crate::store::Store;
use sqlx::Row;
use std::sync::{Arc, RwLock};

/// What this node currently knows about itself. `family_id`/`family_secret`
/// flip from `None` exactly once, when a family is created or joined.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: u8,
    pub family_id: Option<String>,
    pub family_secret: Option<Vec<u8>>,
}

pub type IdentityHandle = Arc<RwLock<LocalIdentity>>;

/// Load identity from `family_config` when paired, else from the sticky
/// `device_id` meta key (created on first run).
pub async fn load_or_create(store: &Store, config: &DeviceConfig) -> Result<IdentityHandle> {
    let family = sqlx::query(
        "SELECT family_id, family_secret, device_id, device_name, created_at FROM family_config WHERE id = 1",
    )
    .fetch_optional(store.pool())
    .await?;
    let identity = match family {
        Some(row) => {
            let family = FamilyConfig::from_row(&row)?;
            LocalIdentity {
                device_id: family.device_id,
                device_name: family.device_name,
                device_type: config.device_type,
                family_id: Some(family.family_id),
                family_secret: Some(family.family_secret),
            }
        }
        None => {
            let existing = sqlx::query("SELECT value FROM meta WHERE key = 'device_id'")
                .fetch_optional(store.pool())
                .await?;
            let device_id = match existing {
                Some(row) => row.try_get("value")?,
                None => {
                    let device_id = uuid::Uuid::new_v4().to_string();
                    sqlx::query("INSERT INTO meta (key, value) VALUES ('device_id', ?)")
                        .bind(&device_id)
                        .execute(store.pool())
                        .await?;
                    device_id
                }
            };
            LocalIdentity {
                device_id,
                device_name: config.name.clone(),
                device_type: config.device_type,
                family_id: None,
                family_secret: None,
            }
        }
    };
    Ok(Arc::new(RwLock::new(identity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn device_id_is_sticky_across_loads() {
        let store = Store::open_in_memory().await.unwrap();
        let config = DeviceConfig::default();
        let first = load_or_create(&store, &config).await.unwrap();
        let second = load_or_create(&store, &config).await.unwrap();
        let a = first.read().unwrap().device_id.clone();
        let b = second.read().unwrap().device_id.clone();
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert!(first.read().unwrap().family_id.is_none());
    }
}
