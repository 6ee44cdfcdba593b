//! Scripted engine for unit tests.
//!
//! Records every statement it receives and fails on demand, so setup and
//! teardown paths can be exercised without a real database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{AnalyticsEngine, EngineHandle, QueryRows};
use crate::error::EngineError;

#[derive(Default)]
pub(crate) struct ScriptedEngine {
    pub statements: Arc<Mutex<Vec<String>>>,
    pub opened: Arc<Mutex<Vec<PathBuf>>>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// Statements containing this text fail.
    pub fail_on: Mutex<Option<String>>,
    pub fail_close: bool,
    /// Simulated latency of `open`, to widen race windows.
    pub open_delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            fail_on: Mutex::new(Some(pattern.to_string())),
            ..Self::default()
        }
    }

    pub fn set_fail_on(&self, pattern: Option<&str>) {
        *self.fail_on.lock().expect("fail_on lock") = pattern.map(str::to_string);
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().expect("statements lock").clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl AnalyticsEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn EngineHandle>, EngineError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened
            .lock()
            .expect("opened lock")
            .push(path.to_path_buf());
        // Mimic the engine creating its database file.
        std::fs::write(path, b"scratch")?;
        Ok(Box::new(ScriptedHandle {
            statements: Arc::clone(&self.statements),
            fail_on: self.fail_on.lock().expect("fail_on lock").clone(),
            fail_close: self.fail_close,
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedHandle {
    statements: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

impl ScriptedHandle {
    fn record(&self, sql: &str) -> Result<(), EngineError> {
        self.statements
            .lock()
            .expect("statements lock")
            .push(sql.to_string());
        match &self.fail_on {
            Some(pattern) if sql.contains(pattern.as_str()) => {
                Err(EngineError::Query(format!("scripted failure on '{pattern}'")))
            }
            _ => Ok(()),
        }
    }
}

impl EngineHandle for ScriptedHandle {
    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.record(sql)
    }

    fn query(&mut self, sql: &str) -> Result<QueryRows, EngineError> {
        self.record(sql)?;
        Ok(QueryRows {
            columns: vec!["sql".to_string()],
            rows: vec![vec![sql.into()]],
        })
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(EngineError::Query("scripted close failure".to_string()));
        }
        Ok(())
    }
}
