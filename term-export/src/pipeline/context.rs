//! Per-run state threaded through every phase.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::error::{ExportError, Result};

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validating,
    KeySetup,
    Analyzing,
    /// Processing one shard
    Shard(u32),
    Finalizing,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => write!(f, "validating"),
            Self::KeySetup => write!(f, "key_setup"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Shard(id) => write!(f, "shard_{id:03}"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One structured run log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub level: LogLevel,
    pub message: String,
}

/// A temporary resource that could not be released. Logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupWarning {
    pub resource: String,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not release {}: {}", self.resource, self.message)
    }
}

/// Log, counters, and live temporary resources of one run.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    log: Mutex<Vec<LogEntry>>,
    files: Mutex<Vec<String>>,
    files_processed: AtomicU64,
    rows_exported: AtomicU64,
    expected_rows: AtomicU64,
    resources: Mutex<HashMap<u64, PathBuf>>,
    next_resource: AtomicU64,
    warnings: Mutex<Vec<CleanupWarning>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            log: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            files_processed: AtomicU64::new(0),
            rows_exported: AtomicU64::new(0),
            expected_rows: AtomicU64::new(0),
            resources: Mutex::new(HashMap::new()),
            next_resource: AtomicU64::new(0),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Appends a log entry and mirrors it to `tracing`.
    pub fn log(&self, phase: Phase, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(run_id = %self.run_id, %phase, "{message}"),
            LogLevel::Warn => warn!(run_id = %self.run_id, %phase, "{message}"),
            LogLevel::Error => error!(run_id = %self.run_id, %phase, "{message}"),
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                timestamp: Utc::now(),
                phase,
                level,
                message,
            });
    }

    pub fn info(&self, phase: Phase, message: impl Into<String>) {
        self.log(phase, LogLevel::Info, message);
    }

    pub fn warn(&self, phase: Phase, message: impl Into<String>) {
        self.log(phase, LogLevel::Warn, message);
    }

    pub fn error(&self, phase: Phase, message: impl Into<String>) {
        self.log(phase, LogLevel::Error, message);
    }

    /// Snapshot of the log so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records one uploaded file and its row count.
    pub fn record_file(&self, remote: impl Into<String>, rows: u64) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(remote.into());
        self.files_processed.fetch_add(1, Ordering::SeqCst);
        self.rows_exported.fetch_add(rows, Ordering::SeqCst);
    }

    /// Uploaded files, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner).clone();
        files.sort();
        files
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed.load(Ordering::SeqCst)
    }

    pub fn rows_exported(&self) -> u64 {
        self.rows_exported.load(Ordering::SeqCst)
    }

    pub fn set_expected_rows(&self, rows: u64) {
        self.expected_rows.store(rows, Ordering::SeqCst);
    }

    pub fn expected_rows(&self) -> u64 {
        self.expected_rows.load(Ordering::SeqCst)
    }

    /// Creates a temporary directory released when the guard drops.
    pub fn scoped_dir(&self, label: &str) -> Result<ScopedDir<'_>> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("term-export-{label}-"))
            .tempdir()
            .map_err(|e| ExportError::Internal(format!("cannot create {label} directory: {e}")))?;
        let id = self.next_resource.fetch_add(1, Ordering::SeqCst);
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, dir.path().to_path_buf());
        Ok(ScopedDir {
            dir: Some(dir),
            id,
            ctx: self,
        })
    }

    /// Number of registered temporary resources not yet released.
    pub fn live_resources(&self) -> usize {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Logs a failed release without escalating it.
    pub fn cleanup_warning(&self, phase: Phase, resource: impl Into<String>, message: impl Into<String>) {
        let warning = CleanupWarning {
            resource: resource.into(),
            message: message.into(),
        };
        self.warn(phase, warning.to_string());
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }

    pub fn cleanup_warnings(&self) -> Vec<CleanupWarning> {
        self.warnings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes every resource still registered. Failures become cleanup
    /// warnings. Returns the number of resources swept.
    pub fn sweep(&self, phase: Phase) -> usize {
        let leftovers: Vec<PathBuf> = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, path)| path)
            .collect();
        for path in &leftovers {
            if let Err(e) = std::fs::remove_dir_all(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    self.cleanup_warning(phase, path.display().to_string(), e.to_string());
                }
            }
        }
        leftovers.len()
    }

    fn release(&self, id: u64) {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// A run-registered temporary directory.
#[derive(Debug)]
pub struct ScopedDir<'a> {
    dir: Option<TempDir>,
    id: u64,
    ctx: &'a RunContext,
}

impl ScopedDir<'_> {
    pub fn path(&self) -> &Path {
        self.dir.as_ref().map(TempDir::path).unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for ScopedDir<'_> {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                self.ctx.cleanup_warning(Phase::Finalizing, path, e.to_string());
            }
        }
        self.ctx.release(self.id);
    }
}
