//! Registry behavior through the public API, against an in-memory fake engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;

use duckhouse::config::{CatalogConfig, EngineConfig, StorageConfig};
use duckhouse::engine::{AnalyticsEngine, EngineHandle, QueryRows};
use duckhouse::error::{EngineError, RegistryError};
use duckhouse::tenant::{
    RegistryCell, RegistryConfig, TenantConnection, TenantCredentials, TenantRegistry,
};

// ============================================================================
// Fake engine
// ============================================================================

#[derive(Default)]
struct FakeEngine {
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
    /// Statements containing this text fail.
    fail_on: Option<String>,
    open_delay: Option<Duration>,
    close_delay: Option<Duration>,
    /// Tenant whose open blocks until `release` receives.
    gated_tenant: Option<String>,
    release: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
}

impl FakeEngine {
    fn failing_on(pattern: &str) -> Self {
        Self {
            fail_on: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl AnalyticsEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn EngineHandle>, EngineError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if self.gated_tenant.as_deref() == Some(stem) {
            if let Some(release) = &self.release {
                let _ = release
                    .lock()
                    .expect("release lock")
                    .recv_timeout(Duration::from_secs(10));
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::fs::write(path, b"fake")?;
        Ok(Box::new(FakeHandle {
            fail_on: self.fail_on.clone(),
            close_delay: self.close_delay,
            closes: Arc::clone(&self.closes),
            statements: Arc::clone(&self.statements),
        }))
    }
}

struct FakeHandle {
    fail_on: Option<String>,
    close_delay: Option<Duration>,
    closes: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl EngineHandle for FakeHandle {
    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.statements
            .lock()
            .expect("statements lock")
            .push(sql.to_string());
        match &self.fail_on {
            Some(pattern) if sql.contains(pattern.as_str()) => {
                Err(EngineError::Query(format!("simulated failure: {pattern}")))
            }
            _ => Ok(()),
        }
    }

    fn query(&mut self, sql: &str) -> Result<QueryRows, EngineError> {
        self.execute_batch(sql)?;
        Ok(QueryRows::default())
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        if let Some(delay) = self.close_delay {
            std::thread::sleep(delay);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(scratch: PathBuf, ttl_secs: u64, interval_secs: u64) -> RegistryConfig {
    let mut engine = EngineConfig::new(scratch, Duration::from_secs(ttl_secs));
    engine.cleanup_interval = Duration::from_secs(interval_secs);
    RegistryConfig {
        engine,
        storage: StorageConfig::from_url("http://localhost:9000").expect("storage url"),
        catalog: CatalogConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "ducklake".to_string(),
            user: "postgres".to_string(),
            password: SecretString::from("postgres".to_string()),
        },
    }
}

fn registry(engine: Arc<FakeEngine>, dir: &Path, ttl_secs: u64) -> Arc<TenantRegistry> {
    TenantRegistry::create(engine, config(dir.join("scratch"), ttl_secs, 300))
}

fn creds() -> TenantCredentials {
    TenantCredentials::new("access", "secret")
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_construct_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine {
        open_delay: Some(Duration::from_millis(100)),
        ..FakeEngine::default()
    });
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.get_instance("y", &creds()).await
        }));
    }

    let mut conns: Vec<Arc<TenantConnection>> = Vec::new();
    for task in tasks {
        conns.push(task.await.expect("join").expect("connection"));
    }

    assert_eq!(engine.open_count(), 1);
    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert_eq!(registry.get_stats().await.total_instances, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_construction_completes_and_is_reused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine {
        open_delay: Some(Duration::from_millis(300)),
        ..FakeEngine::default()
    });
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    let first = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_instance("t", &creds()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();
    let _ = first.await;

    let conn = registry.get_instance("t", &creds()).await.expect("conn");
    // Leave time for any stray construction or teardown to land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(engine.open_count(), 1);
    assert_eq!(engine.close_count(), 0);
    assert!(!conn.is_closed());
    assert!(conn.scratch_path().exists());
    assert_eq!(registry.get_stats().await.total_instances, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_eviction_finishes_before_rebuild() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine {
        close_delay: Some(Duration::from_millis(300)),
        ..FakeEngine::default()
    });
    let registry = registry(Arc::clone(&engine), dir.path(), 600);
    let old = registry.get_instance("t", &creds()).await.expect("old");

    let eviction = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.evict("t").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    eviction.abort();
    let _ = eviction.await;

    let new = tokio::time::timeout(
        Duration::from_secs(5),
        registry.get_instance("t", &creds()),
    )
    .await
    .expect("rebuild did not hang")
    .expect("new");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(old.is_closed());
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(!new.is_closed());
    assert!(new.scratch_path().exists());
    assert_eq!(engine.open_count(), 2);
    assert_eq!(engine.close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_tenant_does_not_block_other_tenants() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let engine = Arc::new(FakeEngine {
        gated_tenant: Some("slow".to_string()),
        release: Some(Mutex::new(release_rx)),
        ..FakeEngine::default()
    });
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    let slow = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_instance("slow", &creds()).await })
    };

    let fast = tokio::time::timeout(
        Duration::from_secs(5),
        registry.get_instance("fast", &creds()),
    )
    .await
    .expect("fast tenant was blocked by slow construction");
    assert!(fast.is_ok());

    release_tx.send(()).expect("release slow open");
    slow.await.expect("join").expect("slow connection");
    assert_eq!(registry.get_stats().await.total_instances, 2);
}

#[tokio::test(start_paused = true)]
async fn ttl_boundary_is_exclusive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);
    let ttl = Duration::from_secs(600);

    let conn = registry.get_instance("t", &creds()).await.expect("conn");
    let t0 = conn.last_used();

    assert!(!conn.is_expired_at(ttl, t0));
    assert!(!conn.is_expired_at(ttl, t0 + ttl));
    assert!(conn.is_expired_at(ttl, t0 + ttl + Duration::from_millis(1)));
    assert!(conn.is_expired_at(ttl, t0 + ttl * 2));
}

#[tokio::test(start_paused = true)]
async fn get_instance_refreshes_last_used() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);
    let ttl = Duration::from_secs(600);

    let conn = registry.get_instance("t", &creds()).await.expect("conn");
    tokio::time::advance(Duration::from_secs(400)).await;
    let t1 = tokio::time::Instant::now();
    registry.get_instance("t", &creds()).await.expect("refresh");

    assert_eq!(conn.last_used(), t1);
    assert!(!conn.is_expired_at(ttl, t1 + ttl - Duration::from_millis(1)));
}

#[tokio::test(start_paused = true)]
async fn repeated_sweeps_are_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    registry.get_instance("old", &creds()).await.expect("old");
    tokio::time::advance(Duration::from_secs(700)).await;
    registry.get_instance("new", &creds()).await.expect("new");

    assert_eq!(registry.cleanup_expired_instances().await, 1);
    let after_first = registry.get_stats().await;
    let closes_after_first = engine.close_count();

    assert_eq!(registry.cleanup_expired_instances().await, 0);
    assert_eq!(registry.get_stats().await, after_first);
    assert_eq!(engine.close_count(), closes_after_first);
    assert_eq!(after_first.total_instances, 1);
}

#[tokio::test]
async fn failed_setup_leaves_no_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::failing_on("ATTACH"));
    let registry = registry(Arc::clone(&engine), dir.path(), 600);
    let bad = TenantCredentials::new("bad", "bad");

    let err = registry.get_instance("x", &bad).await.expect_err("attach fails");

    let RegistryError::Setup { tenant_id, source } = err else {
        panic!("expected Setup error");
    };
    assert_eq!(tenant_id, "x");
    assert!(matches!(source, EngineError::Statement { step: "attach_catalog", .. }));
    assert_eq!(registry.get_stats().await.total_instances, 0);
    assert!(registry.list_tenants().await.is_empty());
    // The partial handle was closed and its scratch file removed.
    assert_eq!(engine.close_count(), 1);
    assert!(!dir.path().join("scratch").join("x.duckdb").exists());
}

#[tokio::test]
async fn close_swallows_detach_and_delete_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Setup's stale DETACH failing is ignored, so construction succeeds.
    let engine = Arc::new(FakeEngine::failing_on("DETACH"));
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    let conn = registry.get_instance("z", &creds()).await.expect("conn");
    let scratch = conn.scratch_path().to_path_buf();
    std::fs::remove_file(&scratch).expect("remove scratch");
    std::fs::create_dir(&scratch).expect("block scratch delete");

    conn.close();

    assert!(conn.is_closed());
    assert!(scratch.is_dir());
}

#[tokio::test(start_paused = true)]
async fn stats_do_not_mutate_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    registry.get_instance("a", &creds()).await.expect("a");
    tokio::time::advance(Duration::from_secs(700)).await;
    registry.get_instance("b", &creds()).await.expect("b");

    let first = registry.get_stats().await;
    for _ in 0..5 {
        assert_eq!(registry.get_stats().await, first);
    }
    assert_eq!(first.total_instances, 2);
    assert_eq!(first.active_instances, 1);
    assert_eq!(first.expired_instances, 1);
    assert_eq!(engine.close_count(), 0);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn refresh_extends_lifetime_timeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);
    let ttl = registry.instance_ttl();

    let alice = registry.get_instance("alice", &creds()).await.expect("t=0");
    tokio::time::advance(Duration::from_secs(500)).await;
    let cached = registry.get_instance("alice", &creds()).await.expect("t=500");
    assert!(Arc::ptr_eq(&alice, &cached));

    tokio::time::advance(Duration::from_secs(550)).await;
    assert!(!alice.is_expired(ttl));

    tokio::time::advance(Duration::from_secs(150)).await;
    assert!(alice.is_expired(ttl));
    assert_eq!(engine.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_all_idle_tenants() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    for tenant in ["a", "b", "c"] {
        registry.get_instance(tenant, &creds()).await.expect(tenant);
    }
    tokio::time::advance(Duration::from_secs(700)).await;

    assert_eq!(registry.cleanup_expired_instances().await, 3);
    assert_eq!(registry.get_stats().await.total_instances, 0);
    assert_eq!(engine.close_count(), 3);
    for tenant in ["a", "b", "c"] {
        let scratch = dir.path().join("scratch").join(format!("{tenant}.duckdb"));
        assert!(!scratch.exists(), "{tenant} scratch file left behind");
    }
}

#[tokio::test]
async fn forced_cleanup_on_fresh_registry_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let registry = registry(Arc::clone(&engine), dir.path(), 600);

    assert_eq!(registry.cleanup_expired_instances().await, 0);
    assert_eq!(registry.get_stats().await.total_instances, 0);

    registry.get_instance("fresh", &creds()).await.expect("fresh");
    assert_eq!(registry.cleanup_expired_instances().await, 0);
    assert_eq!(registry.get_stats().await.total_instances, 1);
}

// ============================================================================
// Reaper and lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reaper_evicts_idle_tenants_on_schedule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let cell = RegistryCell::new(engine.clone());
    let registry = cell.init_registry(config(dir.path().join("scratch"), 600, 300));

    registry.get_instance("idle", &creds()).await.expect("idle");

    // Sweeps at 300 and 600 find it fresh; the one at 900 evicts it.
    tokio::time::sleep(Duration::from_secs(650)).await;
    assert_eq!(registry.get_stats().await.total_instances, 1);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(registry.get_stats().await.total_instances, 0);
    assert_eq!(engine.close_count(), 1);

    cell.shutdown_registry().await;
}

#[tokio::test]
async fn shutdown_closes_everything_and_uninitializes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(FakeEngine::default());
    let cell = RegistryCell::new(engine.clone());
    let registry = cell.init_registry(config(dir.path().join("scratch"), 600, 300));

    let a = registry.get_instance("a", &creds()).await.expect("a");
    let b = registry.get_instance("b", &creds()).await.expect("b");

    cell.shutdown_registry().await;

    assert!(a.is_closed() && b.is_closed());
    assert_eq!(engine.close_count(), 2);
    assert!(matches!(cell.get_registry(), Err(RegistryError::NotInitialized)));
    assert!(matches!(
        registry.get_instance("a", &creds()).await,
        Err(RegistryError::ShutDown)
    ));
}
