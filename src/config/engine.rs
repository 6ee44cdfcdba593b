use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Tenant connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding per-tenant scratch database files.
    pub scratch_dir: PathBuf,
    /// Idle time after which a tenant connection is evicted.
    pub instance_ttl: Duration,
    /// Period of the background expiry sweep.
    pub cleanup_interval: Duration,
    /// Upper bound on waiting for the reaper to stop.
    pub stop_timeout: Duration,
    /// Pause after a failed sweep before the reaper resumes.
    pub reaper_backoff: Duration,
}

impl EngineConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let scratch_dir =
            parse_string_env("ENGINE_SCRATCH_DIR", settings.engine.scratch_dir.clone())?;
        if scratch_dir.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "ENGINE_SCRATCH_DIR".to_string(),
                hint: "Set it to a writable directory for tenant scratch files.".to_string(),
            });
        }

        let instance_ttl = positive_secs(
            "ENGINE_INSTANCE_TTL_SECS",
            parse_env("ENGINE_INSTANCE_TTL_SECS", settings.engine.instance_ttl_secs)?,
        )?;
        let cleanup_interval = positive_secs(
            "ENGINE_CLEANUP_INTERVAL_SECS",
            parse_env(
                "ENGINE_CLEANUP_INTERVAL_SECS",
                settings.engine.cleanup_interval_secs,
            )?,
        )?;

        Ok(Self {
            scratch_dir: PathBuf::from(scratch_dir),
            instance_ttl,
            cleanup_interval,
            stop_timeout: Duration::from_secs(parse_env(
                "ENGINE_STOP_TIMEOUT_SECS",
                settings.engine.stop_timeout_secs,
            )?),
            reaper_backoff: Duration::from_secs(parse_env(
                "ENGINE_REAPER_BACKOFF_SECS",
                settings.engine.reaper_backoff_secs,
            )?),
        })
    }

    /// Config for tests and embedders that do not read the environment.
    pub fn new(scratch_dir: impl Into<PathBuf>, instance_ttl: Duration) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            instance_ttl,
            cleanup_interval: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(5),
            reaper_backoff: Duration::from_secs(5),
        }
    }
}

fn positive_secs(key: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
