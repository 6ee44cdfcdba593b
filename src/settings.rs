//! File-backed settings.
//!
//! `Settings` is the lowest configuration layer: built-in defaults, optionally
//! overlaid by a TOML file. Environment variables are applied on top of this
//! by the resolvers in [`crate::config`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub storage: StorageSettings,
    pub catalog: CatalogSettings,
    pub gateway: GatewaySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub scratch_dir: String,
    pub instance_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub reaper_backoff_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scratch_dir: "data/scratch".to_string(),
            instance_ttl_secs: 600,
            cleanup_interval_secs: 300,
            stop_timeout_secs: 5,
            reaper_backoff_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub url: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "ducklake".to_string(),
            user: "postgres".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`. When unset, production environments log JSON.
    pub format: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
