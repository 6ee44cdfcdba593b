//! Operator HTTP API.
//!
//! Exposes registry statistics and maintenance actions:
//!
//! - `GET /api/health`
//! - `GET /api/engine/stats`
//! - `POST /api/engine/cleanup`
//! - `GET /api/engine/tenants`
//! - `DELETE /api/engine/tenants/{tenant_id}`

pub mod server;
pub mod types;

pub use server::{GatewayState, router, start_server};
