use std::path::Path;

use emberline_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

/// Loads [`AppConfig`] from disk and applies environment overrides.
///
/// Environment variables take precedence over file values so deployments can
/// point one binary at different backends without editing config files:
/// `EMBERLINE_BACKEND_URL`, `EMBERLINE_OWNER_ID`, `EMBERLINE_DB_PATH`.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `path` when it exists, otherwise start from defaults.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
            let parsed: AppConfig = toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
            info!("loaded config from {}", path.display());
            parsed
        } else {
            info!("config file {} not found, using defaults", path.display());
            AppConfig::default()
        };

        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(url) = std::env::var("EMBERLINE_BACKEND_URL")
            && !url.is_empty()
        {
            config.backend.base_url = url;
        }
        if let Ok(owner) = std::env::var("EMBERLINE_OWNER_ID")
            && !owner.is_empty()
        {
            config.owner_user_id = owner;
        }
        if let Ok(db) = std::env::var("EMBERLINE_DB_PATH")
            && !db.is_empty()
        {
            config.database_path = db.into();
        }
    }
}
