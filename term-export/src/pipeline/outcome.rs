//! Run results.

use std::fmt;

use chrono::{DateTime, Utc};

use super::context::{LogEntry, Phase};
use crate::audit::{RunAuditRecord, RunStatus};
use crate::error::{ExportError, Result};
use crate::store::TableRef;

/// A fatal error tagged with the phase that raised it.
#[derive(Debug)]
pub struct PhaseError {
    pub phase: Phase,
    pub error: ExportError,
}

impl PhaseError {
    pub fn new(phase: Phase, error: ExportError) -> Self {
        Self { phase, error }
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

impl std::error::Error for PhaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Tags errors with the current phase.
pub trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> std::result::Result<T, PhaseError>;
}

impl<T> InPhase<T> for Result<T> {
    fn in_phase(self, phase: Phase) -> std::result::Result<T, PhaseError> {
        self.map_err(|error| PhaseError::new(phase, error))
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub table: TableRef,
    /// Uploaded encrypted files, sorted
    pub files: Vec<String>,
    /// Uploaded manifest, when one was written
    pub manifest: Option<String>,
    pub n_shards: u32,
    /// Row count of the table when the run analyzed it
    pub total_rows: u64,
    /// Data rows across all exported files
    pub rows_exported: u64,
    pub recipients: Vec<String>,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Where and why a run stopped, and how far it got.
#[derive(Debug)]
pub struct FailureSummary {
    pub run_id: String,
    pub table: TableRef,
    pub phase: Phase,
    pub error: ExportError,
    /// Files uploaded before the failure
    pub files: Vec<String>,
    pub rows_exported: u64,
    pub recipients: Vec<String>,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FailureSummary {
    /// Taxonomy name of the failure.
    pub fn error_kind(&self) -> &'static str {
        self.error.kind()
    }
}

/// The single structured result of a run.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(RunSummary),
    Failed(FailureSummary),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Succeeded(summary) => Some(summary),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureSummary> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Succeeded(s) => &s.run_id,
            Self::Failed(f) => &f.run_id,
        }
    }

    pub fn log(&self) -> &[LogEntry] {
        match self {
            Self::Succeeded(s) => &s.log,
            Self::Failed(f) => &f.log,
        }
    }

    /// Converts into a `Result`, keeping the summary on success.
    pub fn into_result(self) -> std::result::Result<RunSummary, PhaseError> {
        match self {
            Self::Succeeded(summary) => Ok(summary),
            Self::Failed(failure) => Err(PhaseError::new(failure.phase, failure.error)),
        }
    }

    /// Subject and body of the run notification.
    pub fn notification(&self) -> (String, String) {
        match self {
            Self::Succeeded(s) => (
                format!("Export succeeded: {}", s.table),
                format!(
                    "Run {} exported {} files ({} rows) from {} in {} shards for {}.",
                    s.run_id,
                    s.files.len(),
                    s.rows_exported,
                    s.table,
                    s.n_shards,
                    s.recipients.join(", ")
                ),
            ),
            Self::Failed(f) => (
                format!("Export failed: {}", f.table),
                format!(
                    "Run {} failed during {} with {}: {}. {} files were uploaded before the failure.",
                    f.run_id,
                    f.phase,
                    f.error_kind(),
                    f.error,
                    f.files.len()
                ),
            ),
        }
    }

    /// The audit record for this run.
    pub fn audit_record(&self) -> RunAuditRecord {
        match self {
            Self::Succeeded(s) => RunAuditRecord {
                run_id: s.run_id.clone(),
                table: s.table.clone(),
                status: RunStatus::Succeeded,
                failed_phase: None,
                error_kind: None,
                error_message: None,
                files_processed: s.files.len() as u64,
                total_rows: s.rows_exported,
                recipients: s.recipients.clone(),
                log: s.log.clone(),
                started_at: s.started_at,
                finished_at: s.finished_at,
            },
            Self::Failed(f) => RunAuditRecord {
                run_id: f.run_id.clone(),
                table: f.table.clone(),
                status: RunStatus::Failed,
                failed_phase: Some(f.phase.to_string()),
                error_kind: Some(f.error_kind().to_string()),
                error_message: Some(f.error.to_string()),
                files_processed: f.files.len() as u64,
                total_rows: f.rows_exported,
                recipients: f.recipients.clone(),
                log: f.log.clone(),
                started_at: f.started_at,
                finished_at: f.finished_at,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> RunOutcome {
        RunOutcome::Failed(FailureSummary {
            run_id: "run-1".to_string(),
            table: TableRef::bare("orders"),
            phase: Phase::KeySetup,
            error: ExportError::key_import("ops.pub", "malformed"),
            files: Vec::new(),
            rows_exported: 0,
            recipients: Vec::new(),
            log: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
    }

    #[test]
    fn test_failure_audit_record_and_notification() {
        let outcome = failed();
        assert!(!outcome.is_success());

        let record = outcome.audit_record();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failed_phase.as_deref(), Some("key_setup"));
        assert_eq!(record.error_kind.as_deref(), Some("KeyImportError"));

        let (subject, body) = outcome.notification();
        assert_eq!(subject, "Export failed: orders");
        assert!(body.contains("KeyImportError"));

        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.phase, Phase::KeySetup);
    }
}
