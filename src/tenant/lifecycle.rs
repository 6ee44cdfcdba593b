//! Application lifecycle hooks for the tenant registry.
//!
//! A [`RegistryCell`] is built once in `main` and handed to every consumer.
//! Nothing happens at construction time; the registry and its reaper only
//! exist between [`RegistryCell::init_registry`] and
//! [`RegistryCell::shutdown_registry`].

use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::AnalyticsEngine;
use crate::error::{EngineError, RegistryError};
use crate::tenant::connection::REQUIRED_EXTENSIONS;
use crate::tenant::registry::{RegistryConfig, TenantRegistry};

pub struct RegistryCell {
    engine: Arc<dyn AnalyticsEngine>,
    registry: Mutex<Option<Arc<TenantRegistry>>>,
}

impl std::fmt::Debug for RegistryCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCell")
            .field("engine", &self.engine.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl RegistryCell {
    pub fn new(engine: Arc<dyn AnalyticsEngine>) -> Self {
        Self {
            engine,
            registry: Mutex::new(None),
        }
    }

    /// Install the engine extensions tenant connections load, once per process.
    pub async fn prepare_engine(&self) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.prepare(&REQUIRED_EXTENSIONS))
            .await
            .map_err(|e| EngineError::Unavailable(format!("extension install task failed: {e}")))??;
        tracing::info!(
            engine = self.engine.name(),
            extensions = ?REQUIRED_EXTENSIONS,
            "Engine extensions installed"
        );
        Ok(())
    }

    /// Create the registry and start its reaper. Later calls return the
    /// existing registry and ignore `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init_registry(&self, config: RegistryConfig) -> Arc<TenantRegistry> {
        let mut slot = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registry) = slot.as_ref() {
            tracing::debug!("Tenant registry already initialized");
            return Arc::clone(registry);
        }

        let registry = TenantRegistry::create(Arc::clone(&self.engine), config);
        registry.start_cleanup_worker();
        *slot = Some(Arc::clone(&registry));
        tracing::info!("Tenant registry initialized");
        registry
    }

    pub fn get_registry(&self) -> Result<Arc<TenantRegistry>, RegistryError> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RegistryError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the reaper and close every connection. No-op when uninitialized.
    pub async fn shutdown_registry(&self) {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(registry) = registry else {
            tracing::debug!("Tenant registry not initialized, nothing to shut down");
            return;
        };

        tracing::info!("Tenant registry shutting down");
        let closed = registry.close().await;
        tracing::info!(closed, "Tenant registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::RegistryCell;
    use crate::config::{CatalogConfig, EngineConfig, StorageConfig};
    use crate::engine::scripted::ScriptedEngine;
    use crate::error::RegistryError;
    use crate::tenant::connection::TenantCredentials;
    use crate::tenant::registry::RegistryConfig;

    fn config(dir: &Path) -> RegistryConfig {
        RegistryConfig {
            engine: EngineConfig::new(dir.join("scratch"), Duration::from_secs(600)),
            storage: StorageConfig {
                endpoint: "minio:9000".to_string(),
                use_ssl: false,
            },
            catalog: CatalogConfig {
                host: "pg".to_string(),
                port: 5432,
                database: "lake".to_string(),
                user: "lake".to_string(),
                password: SecretString::from(String::new()),
            },
        }
    }

    #[tokio::test]
    async fn get_registry_before_init_fails() {
        let cell = RegistryCell::new(Arc::new(ScriptedEngine::default()));
        assert!(matches!(cell.get_registry(), Err(RegistryError::NotInitialized)));
        assert!(!cell.is_initialized());
    }

    #[tokio::test]
    async fn init_is_idempotent_and_starts_reaper() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cell = RegistryCell::new(Arc::new(ScriptedEngine::default()));

        let first = cell.init_registry(config(dir.path()));
        let second = cell.init_registry(config(dir.path()));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_cleanup_worker_running());
        assert!(Arc::ptr_eq(&first, &cell.get_registry().expect("registry")));
        cell.shutdown_registry().await;
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_clears_cell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::default());
        let cell = RegistryCell::new(engine.clone());

        let registry = cell.init_registry(config(dir.path()));
        let conn = registry
            .get_instance("alice", &TenantCredentials::new("ak", "sk"))
            .await
            .expect("conn");

        cell.shutdown_registry().await;

        assert!(conn.is_closed());
        assert!(!registry.is_cleanup_worker_running());
        assert!(matches!(cell.get_registry(), Err(RegistryError::NotInitialized)));

        // Shutting down twice is harmless, and a later init starts fresh.
        cell.shutdown_registry().await;
        let fresh = cell.init_registry(config(dir.path()));
        assert!(!Arc::ptr_eq(&registry, &fresh));
        assert_eq!(fresh.get_stats().await.total_instances, 0);
        cell.shutdown_registry().await;
    }

    #[tokio::test]
    async fn prepare_engine_succeeds_with_default_prepare() {
        let cell = RegistryCell::new(Arc::new(ScriptedEngine::default()));
        cell.prepare_engine().await.expect("prepare");
    }
}
