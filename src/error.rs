//! Error types for duckhouse.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the embedded analytical engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to open engine at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Setup step '{step}' failed: {reason}")]
    Statement { step: &'static str, reason: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Engine handle is closed")]
    Closed,

    #[error("Engine backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the tenant registry and its lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tenant registry not initialized. Call init_registry() during startup.")]
    NotInitialized,

    #[error("Tenant registry is shut down")]
    ShutDown,

    #[error("Invalid tenant id '{tenant_id}': {reason}")]
    InvalidTenant { tenant_id: String, reason: String },

    #[error("Failed to set up connection for tenant {tenant_id}: {source}")]
    Setup {
        tenant_id: String,
        #[source]
        source: EngineError,
    },

    #[error("Engine task failed: {0}")]
    Task(String),
}

impl RegistryError {
    /// Whether the caller may retry the request later.
    ///
    /// Only construction-path failures are transient. A missing registry is a
    /// wiring bug and an invalid tenant id will never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Setup { .. } | Self::Task(_))
    }
}

/// Errors from the dataset query service.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Query for tenant {tenant_id} failed: {source}")]
    Engine {
        tenant_id: String,
        #[source]
        source: EngineError,
    },
}

/// Operator gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}
