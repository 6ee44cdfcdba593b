//! Request and response types for the operator API.

use serde::Serialize;

use crate::tenant::{RegistryStats, TenantInfo};

/// Uniform JSON envelope for every `/api/engine` response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

pub type StatsResponse = ApiResponse<RegistryStats>;

#[derive(Debug, Serialize)]
pub struct CleanupData {
    pub evicted: usize,
    pub stats: RegistryStats,
}

#[derive(Debug, Serialize)]
pub struct TenantListData {
    pub tenants: Vec<TenantInfo>,
}

#[derive(Debug, Serialize)]
pub struct EvictData {
    pub tenant_id: String,
    pub evicted: bool,
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub registry_initialized: bool,
    pub uptime_secs: u64,
}
