//! One tenant's live engine connection.
//!
//! ```text
//! TenantConnection
//! ├── handle: engine handle on <scratch_dir>/<tenant_id>.duckdb
//! ├── storage secret, scoped to s3://<tenant_id>
//! ├── default postgres secret, used by the catalog attach
//! └── "catalog_<tenant_id>": DuckLake attachment, DATA_PATH s3://<tenant_id>/data/
//! ```
//!
//! Construction is all-or-nothing: a failing setup step tears the partial
//! handle down before the error is returned. Teardown never fails.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use crate::config::{CatalogConfig, StorageConfig};
use crate::engine::{AnalyticsEngine, EngineHandle, QueryRows, quote_ident, quote_literal};
use crate::error::{EngineError, RegistryError};

/// Extensions every tenant connection loads.
pub const REQUIRED_EXTENSIONS: [&str; 3] = ["httpfs", "postgres", "ducklake"];

const SCRATCH_EXTENSION: &str = "duckdb";
const MAX_TENANT_ID_LEN: usize = 128;

/// Capability tokens for a tenant's object storage namespace.
#[derive(Debug)]
pub struct TenantCredentials {
    pub access_key: String,
    pub secret_key: SecretString,
}

impl TenantCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: SecretString::from(secret_key.into()),
        }
    }
}

impl Clone for TenantCredentials {
    fn clone(&self) -> Self {
        Self::new(self.access_key.clone(), self.secret_key.expose_secret())
    }
}

/// Tenant-independent inputs for building connections.
#[derive(Debug)]
pub struct ConnectionSetup {
    pub scratch_dir: PathBuf,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
}

/// Ordered steps of connection setup, named in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    LoadExtensions,
    StorageSecret,
    CatalogSecret,
    DetachStale,
    AttachCatalog,
    UseCatalog,
}

impl SetupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadExtensions => "load_extensions",
            Self::StorageSecret => "storage_secret",
            Self::CatalogSecret => "catalog_secret",
            Self::DetachStale => "detach_stale",
            Self::AttachCatalog => "attach_catalog",
            Self::UseCatalog => "use_catalog",
        }
    }

    /// Steps whose failure is logged and ignored.
    fn is_best_effort(&self) -> bool {
        matches!(self, Self::DetachStale)
    }
}

/// Validate a tenant id.
///
/// Allowed characters: [a-zA-Z0-9_-]
/// Length: 1-128 characters
///
/// The id ends up in a file name, a catalog identifier and a storage path,
/// so anything outside this set is rejected rather than escaped.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), RegistryError> {
    if tenant_id.is_empty() || tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(RegistryError::InvalidTenant {
            tenant_id: tenant_id.to_string(),
            reason: format!("must be 1-{MAX_TENANT_ID_LEN} characters"),
        });
    }

    let valid = tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(RegistryError::InvalidTenant {
            tenant_id: tenant_id.to_string(),
            reason: "can only contain a-z, A-Z, 0-9, _, -".to_string(),
        });
    }

    Ok(())
}

pub fn catalog_name_for(tenant_id: &str) -> String {
    format!("catalog_{tenant_id}")
}

pub fn scratch_path_for(scratch_dir: &Path, tenant_id: &str) -> PathBuf {
    scratch_dir.join(format!("{tenant_id}.{SCRATCH_EXTENSION}"))
}

/// SQL for every setup step after the handle is open, in execution order.
pub fn setup_plan(
    tenant_id: &str,
    credentials: &TenantCredentials,
    setup: &ConnectionSetup,
) -> Vec<(SetupStep, String)> {
    let catalog = quote_ident(&catalog_name_for(tenant_id));

    let extensions = REQUIRED_EXTENSIONS
        .iter()
        .map(|ext| format!("INSTALL {ext}; LOAD {ext};"))
        .collect::<Vec<_>>()
        .join(" ");

    // CREATE OR REPLACE keeps retries from failing on an existing secret.
    let storage_secret = format!(
        "CREATE OR REPLACE SECRET tenant_storage (TYPE s3, KEY_ID {}, SECRET {}, ENDPOINT {}, USE_SSL {}, URL_STYLE 'path', SCOPE {});",
        quote_literal(&credentials.access_key),
        quote_literal(credentials.secret_key.expose_secret()),
        quote_literal(&setup.storage.endpoint),
        setup.storage.use_ssl,
        quote_literal(&format!("s3://{tenant_id}")),
    );

    // Must stay unnamed: the attach below only resolves the default postgres secret.
    let catalog_secret = format!(
        "CREATE OR REPLACE SECRET (TYPE postgres, HOST {}, PORT {}, DATABASE {}, USER {}, PASSWORD {});",
        quote_literal(&setup.catalog.host),
        setup.catalog.port,
        quote_literal(&setup.catalog.database),
        quote_literal(&setup.catalog.user),
        quote_literal(setup.catalog.password.expose_secret()),
    );

    let attach = format!(
        "ATTACH {} AS {catalog} (DATA_PATH {});",
        quote_literal(&format!(
            "ducklake:postgres:dbname={}",
            setup.catalog.database
        )),
        quote_literal(&format!("s3://{tenant_id}/data/")),
    );

    vec![
        (SetupStep::LoadExtensions, extensions),
        (SetupStep::StorageSecret, storage_secret),
        (SetupStep::CatalogSecret, catalog_secret),
        (
            SetupStep::DetachStale,
            format!("DETACH DATABASE IF EXISTS {catalog};"),
        ),
        (SetupStep::AttachCatalog, attach),
        (SetupStep::UseCatalog, format!("USE {catalog};")),
    ]
}

/// A tenant's engine handle plus its idle-time bookkeeping.
pub struct TenantConnection {
    tenant_id: String,
    catalog_name: String,
    scratch_path: PathBuf,
    created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
    handle: Mutex<Option<Box<dyn EngineHandle>>>,
}

impl std::fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnection")
            .field("tenant_id", &self.tenant_id)
            .field("catalog_name", &self.catalog_name)
            .field("scratch_path", &self.scratch_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TenantConnection {
    /// Open and fully configure a connection for `tenant_id`.
    ///
    /// Blocking: runs engine I/O and, for DuckLake, network calls.
    pub fn open(
        engine: &dyn AnalyticsEngine,
        setup: &ConnectionSetup,
        tenant_id: &str,
        credentials: &TenantCredentials,
    ) -> Result<Self, EngineError> {
        let scratch_path = scratch_path_for(&setup.scratch_dir, tenant_id);
        std::fs::create_dir_all(&setup.scratch_dir)?;

        tracing::info!(
            tenant_id,
            engine = engine.name(),
            path = %scratch_path.display(),
            "Initializing tenant connection"
        );
        let mut handle = engine.open(&scratch_path)?;

        for (step, sql) in setup_plan(tenant_id, credentials, setup) {
            match handle.execute_batch(&sql) {
                Ok(()) => tracing::debug!(tenant_id, step = step.as_str(), "Setup step complete"),
                Err(e) if step.is_best_effort() => {
                    tracing::debug!(tenant_id, step = step.as_str(), "Ignoring setup error: {}", e);
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id,
                        step = step.as_str(),
                        "Tenant connection setup failed: {}",
                        e
                    );
                    if let Err(close_err) = handle.close() {
                        tracing::warn!(tenant_id, "Failed to close partial handle: {}", close_err);
                    }
                    remove_scratch_files(&scratch_path, tenant_id);
                    return Err(EngineError::Statement {
                        step: step.as_str(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(tenant_id, "Tenant connection initialized");
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            catalog_name: catalog_name_for(tenant_id),
            scratch_path,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the idle timer.
    pub fn update_last_used(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        tracing::trace!(tenant_id = %self.tenant_id, "Idle timer reset");
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(ttl, Instant::now())
    }

    /// Expired once idle strictly longer than `ttl`.
    pub fn is_expired_at(&self, ttl: Duration, now: Instant) -> bool {
        self.idle_for(now) > ttl
    }

    pub fn is_closed(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Run a query on this tenant's handle. Blocking.
    pub fn query(&self, sql: &str) -> Result<QueryRows, EngineError> {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_mut().ok_or(EngineError::Closed)?;
        handle.query(sql)
    }

    /// Run statements that produce no result set. Blocking.
    pub fn execute(&self, sql: &str) -> Result<(), EngineError> {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_mut().ok_or(EngineError::Closed)?;
        handle.execute_batch(sql)
    }

    /// Tear the connection down. Never fails and is safe to call twice.
    ///
    /// Detaches the catalog, closes the handle and deletes the scratch file,
    /// logging and skipping whatever fails along the way.
    pub fn close(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            // The active database cannot be detached; switch back to the local file first.
            let local = quote_ident(&self.tenant_id);
            if let Err(e) = handle.execute_batch(&format!("USE {local};")) {
                tracing::debug!(tenant_id = %self.tenant_id, "Failed to switch to local database: {}", e);
            }
            let detach = format!(
                "DETACH DATABASE IF EXISTS {};",
                quote_ident(&self.catalog_name)
            );
            if let Err(e) = handle.execute_batch(&detach) {
                tracing::warn!(tenant_id = %self.tenant_id, "Failed to detach catalog: {}", e);
            }
            match handle.close() {
                Ok(()) => tracing::debug!(tenant_id = %self.tenant_id, "Closed engine handle"),
                Err(e) => {
                    tracing::warn!(tenant_id = %self.tenant_id, "Failed to close engine handle: {}", e)
                }
            }
        }

        remove_scratch_files(&self.scratch_path, &self.tenant_id);
    }
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::warn!(tenant_id = %self.tenant_id, "Tenant connection dropped without close");
            self.close();
        }
    }
}

fn remove_scratch_files(scratch_path: &Path, tenant_id: &str) {
    let mut wal = scratch_path.as_os_str().to_owned();
    wal.push(".wal");

    for path in [scratch_path.to_path_buf(), PathBuf::from(wal)] {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(tenant_id, path = %path.display(), "Deleted scratch file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                tenant_id,
                path = %path.display(),
                "Failed to delete scratch file: {}",
                e
            ),
        }
    }
}
