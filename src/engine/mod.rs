//! Embedded analytical engine abstraction.
//!
//! Provides a backend-agnostic pair of traits for opening and driving engine
//! handles. One implementation exists behind a feature flag:
//!
//! - `duckdb` (default): embedded DuckDB via the `duckdb` crate
//!
//! Tenant connections only ever talk to `Box<dyn EngineHandle>`, so tests can
//! substitute an engine that records statements or fails on demand.

#[cfg(feature = "duckdb")]
pub mod duckdb;

#[cfg(test)]
pub(crate) mod scripted;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;

/// Factory for engine handles.
pub trait AnalyticsEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// One-time process setup, e.g. downloading extensions ahead of the
    /// first tenant connection.
    fn prepare(&self, _extensions: &[&str]) -> Result<(), EngineError> {
        Ok(())
    }

    /// Open a handle backed by the database file at `path`.
    fn open(&self, path: &Path) -> Result<Box<dyn EngineHandle>, EngineError>;
}

/// A single open engine connection. Used from one thread at a time.
pub trait EngineHandle: Send {
    /// Run one or more statements, discarding any result set.
    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError>;

    /// Run a query and collect every row.
    fn query(&mut self, sql: &str) -> Result<QueryRows, EngineError>;

    /// Close the handle, releasing the underlying database file.
    fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// Materialized result of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build the default engine for this build.
pub fn default_engine() -> Result<Arc<dyn AnalyticsEngine>, EngineError> {
    #[cfg(feature = "duckdb")]
    {
        Ok(Arc::new(self::duckdb::DuckDbEngine::new()))
    }
    #[cfg(not(feature = "duckdb"))]
    {
        Err(EngineError::Unavailable(
            "No engine backend available. Enable the 'duckdb' feature.".to_string(),
        ))
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
