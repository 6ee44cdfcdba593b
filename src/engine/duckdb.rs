//! DuckDB backend for the engine traits.

use std::path::Path;

use duckdb::Connection;
use duckdb::types::Value;
use serde_json::Value as JsonValue;

use crate::engine::{AnalyticsEngine, EngineHandle, QueryRows};
use crate::error::EngineError;

/// Opens one file-backed DuckDB database per handle.
#[derive(Debug, Default)]
pub struct DuckDbEngine;

impl DuckDbEngine {
    pub fn new() -> Self {
        Self
    }
}

impl AnalyticsEngine for DuckDbEngine {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn prepare(&self, extensions: &[&str]) -> Result<(), EngineError> {
        let conn = Connection::open_in_memory().map_err(|e| EngineError::Open {
            path: ":memory:".into(),
            reason: e.to_string(),
        })?;
        for extension in extensions {
            conn.execute_batch(&format!("INSTALL {extension};"))
                .map_err(|e| EngineError::Statement {
                    step: "install_extensions",
                    reason: format!("{extension}: {e}"),
                })?;
            tracing::debug!(extension, "DuckDB extension installed");
        }
        conn.close().map_err(|(_, e)| EngineError::Query(e.to_string()))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn EngineHandle>, EngineError> {
        let conn = Connection::open(path).map_err(|e| EngineError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(DuckDbHandle { conn }))
    }
}

struct DuckDbHandle {
    conn: Connection,
}

impl EngineHandle for DuckDbHandle {
    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| EngineError::Query(e.to_string()))
    }

    fn query(&mut self, sql: &str) -> Result<QueryRows, EngineError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| EngineError::Query(e.to_string()))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| EngineError::Query(e.to_string()))?;

        // Column metadata is only available once the statement has executed.
        let columns = rows
            .as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default();

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| EngineError::Query(e.to_string()))? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: Value = row
                    .get(idx)
                    .map_err(|e| EngineError::Query(e.to_string()))?;
                values.push(value_to_json(value));
            }
            out.push(values);
        }

        Ok(QueryRows { columns, rows: out })
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.conn
            .close()
            .map_err(|(_, e)| EngineError::Query(e.to_string()))
    }
}

fn float_to_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn value_to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(v) => JsonValue::Bool(v),
        Value::TinyInt(v) => v.into(),
        Value::SmallInt(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::BigInt(v) => v.into(),
        Value::UTinyInt(v) => v.into(),
        Value::USmallInt(v) => v.into(),
        Value::UInt(v) => v.into(),
        Value::UBigInt(v) => v.into(),
        // JSON numbers cannot hold 128-bit integers losslessly.
        Value::HugeInt(v) => JsonValue::String(v.to_string()),
        Value::Float(v) => float_to_json(f64::from(v)),
        Value::Double(v) => float_to_json(v),
        Value::Decimal(v) => JsonValue::String(v.to_string()),
        Value::Text(v) => JsonValue::String(v),
        Value::Blob(bytes) => JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect()),
        other => JsonValue::String(format!("{other:?}")),
    }
}
