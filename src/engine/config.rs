//! Updraft Configuration Module
//! Server settings come from the environment, client settings from updraft.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CLIENT_CONFIG_FILE: &str = "updraft.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("{0} not configured")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Server-side settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer key protecting /registerToken and /scrape. Empty rejects everything.
    pub api_key: String,
    /// Directory listing to scrape. Checked per request, not at startup.
    pub index_url: Option<String>,
    pub database_path: PathBuf,
    pub lock_dir: PathBuf,
    pub listing: ListingConfig,
    pub push_gateway_url: Option<String>,
    pub push_gateway_key: Option<String>,
}

/// How artifact rows are recognised and labelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingConfig {
    pub artifact_suffix: String,
    pub publisher_prefix: String,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            artifact_suffix: ".apk".to_string(),
            publisher_prefix: "App-".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match non_empty("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw.clone(),
            })?,
            None => default_server_port(),
        };

        let database_path = non_empty("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/updraft.db"));
        let lock_dir = non_empty("LOCK_DIR").map(PathBuf::from).unwrap_or_else(|| {
            database_path
                .parent()
                .map(|p| p.join("locks"))
                .unwrap_or_else(|| PathBuf::from("./locks"))
        });

        let defaults = ListingConfig::default();
        Ok(Self {
            host: non_empty("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            api_key: lookup("API_KEY").unwrap_or_default(),
            index_url: non_empty("INDEX_URL"),
            database_path,
            lock_dir,
            listing: ListingConfig {
                artifact_suffix: non_empty("ARTIFACT_SUFFIX").unwrap_or(defaults.artifact_suffix),
                publisher_prefix: lookup("ARTIFACT_PREFIX").unwrap_or(defaults.publisher_prefix),
            },
            push_gateway_url: non_empty("PUSH_GATEWAY_URL"),
            push_gateway_key: non_empty("PUSH_GATEWAY_KEY"),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn require_index_url(&self) -> Result<&str, ConfigError> {
        self.index_url.as_deref().ok_or(ConfigError::Missing("INDEX_URL"))
    }
}

fn default_server_port() -> u16 {
    8080
}

/// Client-side settings, stored as JSON in the client data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Binary of the installed target application, probed with --version
    #[serde(default)]
    pub installed_binary: Option<PathBuf>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_notifications")]
    pub notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Upper bound on verification attempts; unbounded when absent
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_notifications() -> bool {
    true
}

fn default_base_delay_secs() -> u64 {
    10
}

fn default_max_delay_secs() -> u64 {
    300
}

impl ClientConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join(CLIENT_CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join(CLIENT_CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_backend(base_url: &str, data_dir: &Path) -> Self {
        Self {
            backend_base_url: base_url.trim_end_matches('/').to_string(),
            api_key: String::new(),
            download_dir: data_dir.join("downloads"),
            installed_binary: None,
            backoff: BackoffConfig::default(),
            notifications: default_notifications(),
        }
    }
}
