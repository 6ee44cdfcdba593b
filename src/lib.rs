//! duckhouse: per-tenant DuckDB connections over object storage and a shared
//! DuckLake catalog.
//!
//! Each tenant gets one embedded engine connection, configured with a
//! storage secret scoped to its own bucket and attached to the shared
//! catalog. A [`tenant::TenantRegistry`] hands connections out, evicts idle
//! ones in the background and closes everything on shutdown.

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod settings;
pub mod tenant;
