//! Axum HTTP server for the operator API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use tokio::sync::oneshot;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::{GatewayError, RegistryError};
use crate::gateway::types::*;
use crate::tenant::{RegistryCell, validate_tenant_id};

/// Shared state for all handlers.
pub struct GatewayState {
    pub registry: Arc<RegistryCell>,
    pub startup_time: Instant,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(registry: Arc<RegistryCell>) -> Self {
        Self {
            registry,
            startup_time: Instant::now(),
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Trigger graceful shutdown of a running server. No-op otherwise.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Error side of every engine handler: status plus the JSON envelope.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match err {
            RegistryError::NotInitialized | RegistryError::ShutDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RegistryError::InvalidTenant { .. } => StatusCode::BAD_REQUEST,
            RegistryError::Setup { .. } | RegistryError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!("Operator request failed: {}", err);
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::error(self.message))).into_response()
    }
}

/// Build the router without binding a listener.
pub fn router(state: Arc<GatewayState>) -> Router {
    let engine = Router::new()
        .route("/api/engine/stats", get(stats_handler))
        .route("/api/engine/cleanup", post(cleanup_handler))
        .route("/api/engine/tenants", get(tenants_handler))
        .route("/api/engine/tenants/{tenant_id}", delete(evict_handler));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(engine)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Start the operator API server. Returns the bound address.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<SocketAddr, GatewayError> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::StartupFailed {
                name: "gateway".to_string(),
                reason: format!("Failed to bind to {}: {}", addr, e),
            })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(Arc::clone(&state));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Operator gateway shutting down");
            })
            .await
        {
            tracing::error!("Operator gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Operator gateway listening");
    Ok(bound_addr)
}

// --- Health ---

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        registry_initialized: state.registry.is_initialized(),
        uptime_secs: state.startup_time.elapsed().as_secs(),
    })
}

// --- Engine ---

async fn stats_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let registry = state.registry.get_registry()?;
    let stats = registry.get_stats().await;
    Ok(Json(ApiResponse::ok(
        "Engine statistics retrieved successfully",
        stats,
    )))
}

async fn cleanup_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<ApiResponse<CleanupData>>, ApiError> {
    let registry = state.registry.get_registry()?;
    let evicted = registry.cleanup_expired_instances().await;
    let stats = registry.get_stats().await;
    Ok(Json(ApiResponse::ok(
        "Cleanup completed successfully",
        CleanupData { evicted, stats },
    )))
}

async fn tenants_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<ApiResponse<TenantListData>>, ApiError> {
    let registry = state.registry.get_registry()?;
    let tenants = registry.list_tenants().await;
    Ok(Json(ApiResponse::ok(
        format!("{} live tenant connections", tenants.len()),
        TenantListData { tenants },
    )))
}

async fn evict_handler(
    State(state): State<Arc<GatewayState>>,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    validate_tenant_id(&tenant_id)?;
    let registry = state.registry.get_registry()?;

    if registry.evict(&tenant_id).await {
        let message = format!("Tenant {tenant_id} evicted");
        Ok(Json(ApiResponse::ok(message, EvictData { tenant_id, evicted: true })).into_response())
    } else {
        let message = format!("No live connection for tenant {tenant_id}");
        Ok((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::ok(message, EvictData { tenant_id, evicted: false })),
        )
            .into_response())
    }
}
