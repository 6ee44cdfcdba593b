use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Remote object storage that backs tenant data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Endpoint host (and port) without scheme, as the engine expects it.
    pub endpoint: String,
    pub use_ssl: bool,
}

impl StorageConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let url = parse_string_env("STORAGE_URL", settings.storage.url.clone())?;
        let mut config = Self::from_url(&url)?;
        // STORAGE_USE_SSL wins over the scheme.
        config.use_ssl = parse_bool_env("STORAGE_USE_SSL", config.use_ssl)?;
        Ok(config)
    }

    /// Derive endpoint and TLS flag from a URL such as `https://minio:9000`.
    ///
    /// TLS follows the scheme. A bare `host:port` is treated as plain HTTP.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let trimmed = url.trim();
        let (use_ssl, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (false, rest)
        } else {
            (false, trimmed)
        };

        let endpoint = rest.trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "STORAGE_URL".to_string(),
                hint: "Set it to the object storage endpoint, e.g. http://localhost:9000."
                    .to_string(),
            });
        }
        if endpoint.contains('/') || endpoint.contains('\'') {
            return Err(ConfigError::InvalidValue {
                key: "STORAGE_URL".to_string(),
                message: format!("'{trimmed}' must be a scheme and host only"),
            });
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            use_ssl,
        })
    }
}

/// Connection parameters of the shared catalog metadata store.
///
/// Identical for every tenant; each tenant still gets its own attachment.
#[derive(Debug)]
pub struct CatalogConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: SecretString,
}

impl CatalogConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let password = optional_env("CATALOG_PASSWORD")?
            .or_else(|| settings.catalog.password.clone())
            .unwrap_or_default();

        let config = Self {
            host: parse_string_env("CATALOG_HOST", settings.catalog.host.clone())?,
            port: parse_env("CATALOG_PORT", settings.catalog.port)?,
            database: parse_string_env("CATALOG_DB", settings.catalog.database.clone())?,
            user: parse_string_env("CATALOG_USER", settings.catalog.user.clone())?,
            password: SecretString::from(password),
        };

        for (key, value) in [
            ("CATALOG_HOST", &config.host),
            ("CATALOG_DB", &config.database),
            ("CATALOG_USER", &config.user),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: key.to_string(),
                    hint: "The shared catalog store needs host, database and user.".to_string(),
                });
            }
        }

        Ok(config)
    }
}
