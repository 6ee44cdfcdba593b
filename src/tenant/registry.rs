//! Tenant id to live connection registry.
//!
//! The outer map is only ever locked for short, synchronous map operations.
//! Each tenant has its own slot behind an async mutex; whoever holds the slot
//! lock owns that tenant's construction and teardown, so two tenants never
//! wait on each other's I/O and one tenant never gets two connections.
//!
//! Work that changes a slot (building, rebuilding, retiring) runs in a
//! spawned task that owns the slot guard. A cancelled caller therefore never
//! releases the lock while engine I/O for that tenant is still in flight.
//!
//! A slot leaves the map only while locked and after being marked
//! `Retired`. A waiter that wakes up on a retired slot starts over with a
//! fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::config::{CatalogConfig, EngineConfig, StorageConfig};
use crate::engine::AnalyticsEngine;
use crate::error::RegistryError;
use crate::tenant::connection::{
    ConnectionSetup, TenantConnection, TenantCredentials, validate_tenant_id,
};
use crate::tenant::reaper::Reaper;

/// Everything a registry needs besides the engine.
#[derive(Debug)]
pub struct RegistryConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_instances: usize,
    pub active_instances: usize,
    pub expired_instances: usize,
    /// Seconds.
    pub instance_ttl: u64,
    /// Seconds.
    pub cleanup_interval: u64,
}

/// Diagnostic view of one live tenant connection.
#[derive(Debug, Clone, Serialize)]
pub struct TenantInfo {
    pub tenant_id: String,
    pub catalog_name: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub expired: bool,
}

enum SlotState {
    /// No connection; construction never ran or its task died.
    Vacant,
    Live(Arc<TenantConnection>),
    /// Removed from the map. Never reused.
    Retired,
}

type Slot = Arc<tokio::sync::Mutex<SlotState>>;
type SlotGuard = OwnedMutexGuard<SlotState>;
type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Inputs of a construction task, detached from the registry borrow.
struct BuildJob {
    engine: Arc<dyn AnalyticsEngine>,
    setup: Arc<ConnectionSetup>,
    instances: SlotMap,
    tenant_id: String,
    credentials: TenantCredentials,
}

pub struct TenantRegistry {
    engine: Arc<dyn AnalyticsEngine>,
    setup: Arc<ConnectionSetup>,
    instances: SlotMap,
    instance_ttl: Duration,
    cleanup_interval: Duration,
    stop_timeout: Duration,
    reaper_backoff: Duration,
    reaper: Mutex<Option<Reaper>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("engine", &self.engine.name())
            .field("instance_ttl", &self.instance_ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl TenantRegistry {
    /// Create an empty registry. The reaper is not started.
    pub fn create(engine: Arc<dyn AnalyticsEngine>, config: RegistryConfig) -> Arc<Self> {
        let RegistryConfig {
            engine: engine_config,
            storage,
            catalog,
        } = config;

        tracing::info!(
            engine = engine.name(),
            ttl_secs = engine_config.instance_ttl.as_secs(),
            cleanup_interval_secs = engine_config.cleanup_interval.as_secs(),
            scratch_dir = %engine_config.scratch_dir.display(),
            "Tenant registry created"
        );

        Arc::new(Self {
            engine,
            setup: Arc::new(ConnectionSetup {
                scratch_dir: engine_config.scratch_dir,
                storage,
                catalog,
            }),
            instances: Arc::new(Mutex::new(HashMap::new())),
            instance_ttl: engine_config.instance_ttl,
            cleanup_interval: engine_config.cleanup_interval,
            stop_timeout: engine_config.stop_timeout,
            reaper_backoff: engine_config.reaper_backoff,
            reaper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn instance_ttl(&self) -> Duration {
        self.instance_ttl
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Return the tenant's live connection, building it if needed.
    ///
    /// A fresh cached connection is returned without any I/O and its idle
    /// timer is reset. An expired one is torn down and rebuilt. Concurrent
    /// callers for the same tenant share a single construction; a failed
    /// construction leaves no entry behind. Dropping the returned future
    /// does not abort a construction already under way: it still completes
    /// and the next caller picks the connection up.
    pub async fn get_instance(
        &self,
        tenant_id: &str,
        credentials: &TenantCredentials,
    ) -> Result<Arc<TenantConnection>, RegistryError> {
        validate_tenant_id(tenant_id)?;

        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(RegistryError::ShutDown);
            }

            let slot = self.slot_for(tenant_id);
            let mut state = Arc::clone(&slot).lock_owned().await;

            // close() may have started while we waited for the lock.
            if self.shut_down.load(Ordering::SeqCst) {
                if matches!(*state, SlotState::Vacant) {
                    *state = SlotState::Retired;
                    unmap(&self.instances, tenant_id, &slot);
                }
                return Err(RegistryError::ShutDown);
            }

            match &*state {
                SlotState::Retired => continue,
                SlotState::Live(conn) if !conn.is_expired(self.instance_ttl) => {
                    conn.update_last_used();
                    tracing::debug!(tenant_id, "Using cached tenant connection");
                    return Ok(Arc::clone(conn));
                }
                SlotState::Live(_) | SlotState::Vacant => {}
            }

            let job = BuildJob {
                engine: Arc::clone(&self.engine),
                setup: Arc::clone(&self.setup),
                instances: Arc::clone(&self.instances),
                tenant_id: tenant_id.to_string(),
                credentials: credentials.clone(),
            };
            return tokio::spawn(build_into_slot(job, slot, state))
                .await
                .map_err(|e| RegistryError::Task(e.to_string()))?;
        }
    }

    /// Tear one tenant's connection down. Returns whether one was live.
    pub async fn evict(&self, tenant_id: &str) -> bool {
        let Some(slot) = self.existing_slot(tenant_id) else {
            return false;
        };
        let state = Arc::clone(&slot).lock_owned().await;
        let evicted = self.retire(tenant_id, slot, state).await;
        if evicted {
            tracing::info!(tenant_id, "Evicted tenant connection");
        }
        evicted
    }

    /// Evict every connection idle longer than the TTL.
    ///
    /// Expiry is re-checked under each tenant's slot lock, so a connection
    /// refreshed by a concurrent `get_instance` survives the sweep. Slots
    /// that are locked right now are in use and therefore skipped.
    pub async fn cleanup_expired_instances(&self) -> usize {
        let mut evicted = 0;

        for (tenant_id, slot) in self.snapshot() {
            let Ok(state) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };
            let expired = match &*state {
                SlotState::Live(conn) => conn.is_expired(self.instance_ttl),
                // Unlocked and vacant: its construction task died.
                SlotState::Vacant => true,
                SlotState::Retired => false,
            };
            if !expired {
                continue;
            }
            if self.retire(&tenant_id, slot, state).await {
                tracing::info!(tenant_id = %tenant_id, "Evicted expired tenant connection");
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!("Cleaned up {} expired tenant connections", evicted);
        } else {
            tracing::debug!("No expired tenant connections");
        }
        evicted
    }

    /// Evict every connection regardless of age.
    pub async fn cleanup_all(&self) -> usize {
        let mut evicted = 0;
        for (tenant_id, slot) in self.snapshot() {
            let state = Arc::clone(&slot).lock_owned().await;
            if self.retire(&tenant_id, slot, state).await {
                evicted += 1;
            }
        }
        tracing::info!("Closed {} tenant connections", evicted);
        evicted
    }

    /// Counters over live connections. Never mutates the registry.
    pub async fn get_stats(&self) -> RegistryStats {
        let now = Instant::now();
        let mut active = 0;
        let mut expired = 0;

        for (_, slot) in self.snapshot() {
            let state = slot.lock().await;
            if let SlotState::Live(conn) = &*state {
                if conn.is_expired_at(self.instance_ttl, now) {
                    expired += 1;
                } else {
                    active += 1;
                }
            }
        }

        RegistryStats {
            total_instances: active + expired,
            active_instances: active,
            expired_instances: expired,
            instance_ttl: self.instance_ttl.as_secs(),
            cleanup_interval: self.cleanup_interval.as_secs(),
        }
    }

    /// Live tenants sorted by id.
    pub async fn list_tenants(&self) -> Vec<TenantInfo> {
        let now = Instant::now();
        let mut tenants = Vec::new();

        for (_, slot) in self.snapshot() {
            let state = slot.lock().await;
            if let SlotState::Live(conn) = &*state {
                tenants.push(TenantInfo {
                    tenant_id: conn.tenant_id().to_string(),
                    catalog_name: conn.catalog_name().to_string(),
                    created_at: conn.created_at(),
                    idle_secs: conn.idle_for(now).as_secs(),
                    expired: conn.is_expired_at(self.instance_ttl, now),
                });
            }
        }

        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    /// Start the background reaper. A running reaper is left alone.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_cleanup_worker(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.as_ref().is_some_and(|r| !r.is_finished()) {
            tracing::debug!("Background cleanup worker already running");
            return;
        }
        *reaper = Some(Reaper::spawn(
            Arc::downgrade(self),
            self.cleanup_interval,
            self.reaper_backoff,
        ));
        tracing::info!(
            interval_secs = self.cleanup_interval.as_secs(),
            "Background cleanup worker started"
        );
    }

    /// Signal the reaper and wait for it, aborting it after the stop timeout.
    pub async fn stop_cleanup_worker(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.stop(self.stop_timeout).await;
        }
    }

    pub fn is_cleanup_worker_running(&self) -> bool {
        self.reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.is_finished())
    }

    /// Stop the reaper, refuse further `get_instance` calls and close every
    /// connection.
    pub async fn close(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        self.stop_cleanup_worker().await;
        self.cleanup_all().await
    }

    fn slot_for(&self, tenant_id: &str) -> Slot {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            instances
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SlotState::Vacant))),
        )
    }

    fn existing_slot(&self, tenant_id: &str) -> Option<Slot> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<(String, Slot)> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Retire a locked slot in a task that survives caller cancellation.
    /// Returns whether a live connection was closed.
    async fn retire(&self, tenant_id: &str, slot: Slot, state: SlotGuard) -> bool {
        let instances = Arc::clone(&self.instances);
        let tenant = tenant_id.to_string();
        match tokio::spawn(retire_slot(instances, tenant, slot, state)).await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::error!(tenant_id, "Tenant eviction task failed: {}", e);
                false
            }
        }
    }
}

/// Remove `slot` from the map unless it was already replaced.
fn unmap(instances: &SlotMap, tenant_id: &str, slot: &Slot) {
    let mut instances = instances.lock().unwrap_or_else(PoisonError::into_inner);
    if instances
        .get(tenant_id)
        .is_some_and(|current| Arc::ptr_eq(current, slot))
    {
        instances.remove(tenant_id);
    }
}

/// Mark the slot retired, close its connection, then unmap it. The guard is
/// held throughout, so nobody rebuilds the tenant before its files are gone.
async fn retire_slot(
    instances: SlotMap,
    tenant_id: String,
    slot: Slot,
    mut state: SlotGuard,
) -> bool {
    let closed = match std::mem::replace(&mut *state, SlotState::Retired) {
        SlotState::Live(conn) => {
            close_connection(conn).await;
            true
        }
        SlotState::Vacant | SlotState::Retired => false,
    };
    unmap(&instances, &tenant_id, &slot);
    closed
}

/// Tear down an expired connection, if any, then build a new one into the slot.
async fn build_into_slot(
    job: BuildJob,
    slot: Slot,
    mut state: SlotGuard,
) -> Result<Arc<TenantConnection>, RegistryError> {
    if let SlotState::Live(expired) = std::mem::replace(&mut *state, SlotState::Vacant) {
        tracing::info!(tenant_id = %job.tenant_id, "Tenant connection expired, recreating");
        close_connection(expired).await;
    }

    let BuildJob {
        engine,
        setup,
        instances,
        tenant_id,
        credentials,
    } = job;
    let tenant = tenant_id.clone();
    let started = Instant::now();

    let opened = tokio::task::spawn_blocking(move || {
        TenantConnection::open(engine.as_ref(), &setup, &tenant, &credentials)
    })
    .await;

    let result = match opened {
        Ok(Ok(conn)) => {
            tracing::info!(
                tenant_id = %tenant_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Created tenant connection"
            );
            Ok(Arc::new(conn))
        }
        Ok(Err(source)) => Err(RegistryError::Setup {
            tenant_id: tenant_id.clone(),
            source,
        }),
        Err(e) => Err(RegistryError::Task(e.to_string())),
    };

    match result {
        Ok(conn) => {
            *state = SlotState::Live(Arc::clone(&conn));
            Ok(conn)
        }
        Err(e) => {
            *state = SlotState::Retired;
            unmap(&instances, &tenant_id, &slot);
            Err(e)
        }
    }
}

async fn close_connection(conn: Arc<TenantConnection>) {
    let tenant_id = conn.tenant_id().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || conn.close()).await {
        tracing::error!(tenant_id = %tenant_id, "Tenant connection teardown panicked: {}", e);
    }
}
