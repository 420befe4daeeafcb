//! Append-only JSON-lines audit log on the local filesystem.
//!
//! Each line is one tagged record:
//!
//! ```text
//! {"record":"key_selection","table":{"table":"orders"},"selected_columns":["id"],...}
//! {"record":"run","run_id":"...","status":"SUCCEEDED",...}
//! ```
//!
//! Appends write a single line. An overwrite of key selections rewrites the
//! file through a temporary sibling and an atomic rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{AuditRepository, RunAuditRecord};
use crate::config::PersistPolicy;
use crate::error::{ExportError, Result};
use crate::selector::KeySelectionResult;
use crate::store::TableRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum AuditLine {
    KeySelection(KeySelectionResult),
    Run(RunAuditRecord),
}

/// Audit log stored as one JSON object per line.
pub struct JsonLinesAuditRepository {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAuditRepository {
    /// Opens (or lazily creates) the log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<AuditLine>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    ExportError::Serialization(format!(
                        "{}:{}: {e}",
                        self.path.display(),
                        i + 1
                    ))
                })
            })
            .collect()
    }

    async fn append(&self, line: &AuditLine) -> Result<()> {
        let mut text = serde_json::to_string(line)?;
        text.push('\n');
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rewrite(&self, lines: &[AuditLine]) -> Result<()> {
        let mut text = String::new();
        for line in lines {
            text.push_str(&serde_json::to_string(line)?);
            text.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for JsonLinesAuditRepository {
    #[instrument(skip(self, result), fields(table = %result.table, repository_type = "json_lines"))]
    async fn save_key_selection(
        &self,
        result: &KeySelectionResult,
        policy: PersistPolicy,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let line = AuditLine::KeySelection(result.clone());
        match policy {
            PersistPolicy::Append => self.append(&line).await,
            PersistPolicy::Overwrite => {
                let mut lines = self.read_lines().await?;
                let before = lines.len();
                lines.retain(|l| !matches!(l, AuditLine::KeySelection(r) if r.table == result.table));
                debug!(replaced = before - lines.len(), "Overwriting key selections");
                lines.push(line);
                self.rewrite(&lines).await
            }
        }
    }

    async fn key_selections(&self, table: &TableRef) -> Result<Vec<KeySelectionResult>> {
        Ok(self
            .read_lines()
            .await?
            .into_iter()
            .filter_map(|line| match line {
                AuditLine::KeySelection(r) if &r.table == table => Some(r),
                _ => None,
            })
            .collect())
    }

    #[instrument(skip(self, record), fields(run_id = %record.run_id, repository_type = "json_lines"))]
    async fn save_run(&self, record: &RunAuditRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.append(&AuditLine::Run(record.clone())).await
    }

    async fn runs(&self) -> Result<Vec<RunAuditRecord>> {
        Ok(self
            .read_lines()
            .await?
            .into_iter()
            .filter_map(|line| match line {
                AuditLine::Run(r) => Some(r),
                AuditLine::KeySelection(_) => None,
            })
            .collect())
    }
}
