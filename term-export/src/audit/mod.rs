//! Audit persistence for key selections and export runs.
//!
//! Key-selection records are keyed by table identity; a new record either
//! replaces the earlier ones for the same table or is appended next to them,
//! per [`PersistPolicy`]. Run records are append-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PersistPolicy;
use crate::error::Result;
use crate::pipeline::LogEntry;
use crate::selector::KeySelectionResult;
use crate::store::TableRef;

pub mod in_memory;
pub mod json_lines;

pub use in_memory::InMemoryAuditRepository;
pub use json_lines::JsonLinesAuditRepository;

/// Final status of an export run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Structured summary of one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAuditRecord {
    pub run_id: String,
    pub table: TableRef,
    pub status: RunStatus,
    /// Phase that failed, for failed runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    /// Error taxonomy name, for failed runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub files_processed: u64,
    pub total_rows: u64,
    /// Recipient identities (emails, or key fingerprints when none)
    pub recipients: Vec<String>,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Storage backend for audit records.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Persists a key-selection result.
    async fn save_key_selection(
        &self,
        result: &KeySelectionResult,
        policy: PersistPolicy,
    ) -> Result<()>;

    /// Key-selection results stored for `table`, oldest first.
    async fn key_selections(&self, table: &TableRef) -> Result<Vec<KeySelectionResult>>;

    /// Appends a run record.
    async fn save_run(&self, record: &RunAuditRecord) -> Result<()>;

    /// All run records, oldest first.
    async fn runs(&self) -> Result<Vec<RunAuditRecord>>;
}
