use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level application configuration, loaded from TOML with environment
/// overrides applied by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The single identity allowed to issue directives and exempt from quotas.
    pub owner_user_id: String,
    pub database_path: PathBuf,
    pub default_model: Option<String>,
    pub backend: BackendConfig,
    pub search: SearchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            owner_user_id: String::new(),
            database_path: PathBuf::from("data/emberline.db"),
            default_model: None,
            backend: BackendConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    /// Base URL of the HTML search endpoint.
    pub base_url: String,
    pub max_results: usize,
    /// How many of the top results get their page content fetched.
    pub fetch_pages: usize,
    /// Extracted text cap per fetched page, in characters.
    pub page_char_cap: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://html.duckduckgo.com".to_string(),
            max_results: 5,
            fetch_pages: 3,
            page_char_cap: 1500,
        }
    }
}
