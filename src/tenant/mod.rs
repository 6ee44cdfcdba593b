//! Per-tenant engine connections and their lifecycle.
//!
//! - [`TenantConnection`]: one configured engine handle per tenant
//! - [`TenantRegistry`]: get-or-create, TTL eviction, stats
//! - [`RegistryCell`]: startup/shutdown hooks owning the registry

pub mod connection;
pub mod lifecycle;
mod reaper;
pub mod registry;

pub use connection::{TenantConnection, TenantCredentials, validate_tenant_id};
pub use lifecycle::RegistryCell;
pub use registry::{RegistryConfig, RegistryStats, TenantInfo, TenantRegistry};
