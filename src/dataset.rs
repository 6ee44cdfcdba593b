//! Tenant-scoped query service.
//!
//! Borrows a connection from the registry for each call and runs the
//! statement on the blocking pool. Every call counts as activity and resets
//! the tenant's idle timer.

use std::sync::Arc;

use crate::engine::QueryRows;
use crate::error::{DatasetError, RegistryError};
use crate::tenant::{RegistryCell, TenantConnection, TenantCredentials};

#[derive(Debug, Clone)]
pub struct DatasetService {
    registry: Arc<RegistryCell>,
}

impl DatasetService {
    pub fn new(registry: Arc<RegistryCell>) -> Self {
        Self { registry }
    }

    /// Run a query in the tenant's catalog and collect the rows.
    pub async fn query(
        &self,
        tenant_id: &str,
        credentials: &TenantCredentials,
        sql: &str,
    ) -> Result<QueryRows, DatasetError> {
        let conn = self.connection(tenant_id, credentials).await?;
        tracing::info!(tenant_id, "Executing SQL query");
        tracing::debug!(tenant_id, sql, "Query text");

        let sql = sql.to_string();
        let result = tokio::task::spawn_blocking(move || {
            conn.update_last_used();
            conn.query(&sql)
        })
        .await
        .map_err(|e| RegistryError::Task(e.to_string()))?;

        result.map_err(|source| DatasetError::Engine {
            tenant_id: tenant_id.to_string(),
            source,
        })
    }

    /// Run statements that return no rows, e.g. DDL or inserts.
    pub async fn execute(
        &self,
        tenant_id: &str,
        credentials: &TenantCredentials,
        sql: &str,
    ) -> Result<(), DatasetError> {
        let conn = self.connection(tenant_id, credentials).await?;
        tracing::info!(tenant_id, "Executing SQL statement");
        tracing::debug!(tenant_id, sql, "Statement text");

        let sql = sql.to_string();
        let result = tokio::task::spawn_blocking(move || {
            conn.update_last_used();
            conn.execute(&sql)
        })
        .await
        .map_err(|e| RegistryError::Task(e.to_string()))?;

        result.map_err(|source| DatasetError::Engine {
            tenant_id: tenant_id.to_string(),
            source,
        })
    }

    async fn connection(
        &self,
        tenant_id: &str,
        credentials: &TenantCredentials,
    ) -> Result<Arc<TenantConnection>, DatasetError> {
        let registry = self.registry.get_registry()?;
        Ok(registry.get_instance(tenant_id, credentials).await?)
    }
}
