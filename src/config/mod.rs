//! Configuration for duckhouse.
//!
//! Settings are resolved in two layers: [`Settings`] (defaults plus an
//! optional TOML file) and environment variables, which always win. The
//! binary loads a `.env` file into the environment before resolving.

mod engine;
pub(crate) mod helpers;
mod storage;

use std::net::SocketAddr;
use std::path::Path;

pub use self::engine::EngineConfig;
pub use self::storage::{CatalogConfig, StorageConfig};

use crate::config::helpers::{optional_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Fully resolved service configuration.
#[derive(Debug)]
pub struct Config {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Read the optional settings file and apply env overrides.
    pub fn from_env(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings_path = match settings_path {
            Some(path) => Some(path.to_path_buf()),
            None => optional_env("DUCKHOUSE_CONFIG")?.map(Into::into),
        };
        let settings = Settings::load(settings_path.as_deref())?;
        Self::resolve(&settings)
    }

    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::resolve(settings)?,
            storage: StorageConfig::resolve(settings)?,
            catalog: CatalogConfig::resolve(settings)?,
            gateway: GatewayConfig::resolve(settings)?,
            logging: LoggingConfig::resolve(settings)?,
        })
    }
}

/// Operator HTTP listener.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("GATEWAY_HOST", settings.gateway.host.clone())?,
            port: parse_env("GATEWAY_PORT", settings.gateway.port)?,
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GATEWAY_HOST".to_string(),
                message: format!("'{}:{}' is not a socket address: {e}", self.host, self.port),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message: format!("unsupported format '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` still takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let format = match optional_env("LOG_FORMAT")?.or_else(|| settings.logging.format.clone())
        {
            Some(raw) => LogFormat::from_str(&raw)?,
            None if parse_string_env("APP_ENV", "dev".to_string())? == "prod" => LogFormat::Json,
            None => LogFormat::Pretty,
        };

        Ok(Self {
            level: parse_string_env("LOG_LEVEL", settings.logging.level.clone())?,
            format,
        })
    }
}
