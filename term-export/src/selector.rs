//! Greedy minimal key-column selection.
//!
//! Columns are ranked from sampled statistics (most distinct first, least
//! null as tie-break) and appended to a working key one at a time. After each
//! append the exact number of distinct fingerprints over the working key is
//! counted on the full table; selection stops once
//! `distinct / total_rows >= uniqueness_threshold` or the columns run out.
//! Full scans are therefore bounded by the number of columns appended, not by
//! the table width.
//!
//! Every result, including best-effort results that never reach the
//! threshold, is persisted to the audit repository with its selection path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::audit::AuditRepository;
use crate::config::KeyDiscoveryConfig;
use crate::error::{ExportError, Result};
use crate::log_selection;
use crate::logging::LogConfig;
use crate::profiler::{ColumnProfiler, ColumnStat};
use crate::security::InputValidator;
use crate::store::{FingerprintExpr, Ident, Query, QueryExecutor, TableRef};

/// One greedy step: the key after appending the k-th column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionStep {
    pub k: usize,
    pub columns: Vec<String>,
    pub distinct_count: u64,
    pub ratio: f64,
}

/// Outcome of one key-discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySelectionResult {
    pub table: TableRef,
    pub selected_columns: Vec<String>,
    pub total_rows: u64,
    pub distinct_row_count: u64,
    pub uniqueness_ratio: f64,
    /// Distinct fingerprints equal the row count
    pub exact_unique: bool,
    /// The uniqueness threshold was reached
    pub threshold_met: bool,
    pub selection_path: Vec<SelectionStep>,
    pub column_stats: Vec<ColumnStat>,
    pub sample_fraction: f64,
    pub uniqueness_threshold: f64,
    pub computed_at: DateTime<Utc>,
}

/// Discovers a small set of columns that identifies each row.
pub struct KeyColumnSelector {
    executor: Arc<dyn QueryExecutor>,
    profiler: ColumnProfiler,
    audit: Arc<dyn AuditRepository>,
    config: KeyDiscoveryConfig,
    log_config: LogConfig,
}

impl KeyColumnSelector {
    pub fn new(executor: Arc<dyn QueryExecutor>, audit: Arc<dyn AuditRepository>) -> Self {
        let config = KeyDiscoveryConfig::default();
        Self {
            profiler: ColumnProfiler::builder(Arc::clone(&executor))
                .min_sample_rows(config.min_sample_rows)
                .build(),
            executor,
            audit,
            config,
            log_config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: KeyDiscoveryConfig) -> Self {
        self.profiler = ColumnProfiler::builder(Arc::clone(&self.executor))
            .min_sample_rows(config.min_sample_rows)
            .build();
        self.config = config;
        self
    }

    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = log_config;
        self
    }

    pub fn config(&self) -> &KeyDiscoveryConfig {
        &self.config
    }

    /// Runs selection with the configured fraction and threshold.
    pub async fn select_key_with_defaults(&self, table: &TableRef) -> Result<KeySelectionResult> {
        self.select_key(
            table,
            self.config.sample_fraction,
            self.config.uniqueness_threshold,
        )
        .await
    }

    /// Selects a key for `table` and persists the result.
    ///
    /// # Errors
    ///
    /// [`ExportError::Schema`] when the table has no columns. Not reaching
    /// the threshold is not an error; see [`KeySelectionResult::threshold_met`].
    #[instrument(skip(self), fields(table = %table))]
    pub async fn select_key(
        &self,
        table: &TableRef,
        sample_fraction: f64,
        uniqueness_threshold: f64,
    ) -> Result<KeySelectionResult> {
        InputValidator::validate_fraction(sample_fraction, "sample_fraction")?;
        InputValidator::validate_fraction(uniqueness_threshold, "uniqueness_threshold")?;

        let columns = self.executor.columns(table).await?;
        if columns.is_empty() {
            return Err(ExportError::schema(table.to_string(), "table has no columns"));
        }

        let total_rows = self
            .executor
            .execute(&Query::row_count(table)?)
            .await?
            .count("row_count")?;

        let mut result = KeySelectionResult {
            table: table.clone(),
            selected_columns: Vec::new(),
            total_rows,
            distinct_row_count: 0,
            uniqueness_ratio: 0.0,
            exact_unique: false,
            threshold_met: false,
            selection_path: Vec::new(),
            column_stats: Vec::new(),
            sample_fraction,
            uniqueness_threshold,
            computed_at: Utc::now(),
        };

        if total_rows == 0 {
            info!("Table is empty, no key to select");
            self.persist(&result).await?;
            return Ok(result);
        }

        let stats = self
            .profiler
            .profile_columns(table, &columns, total_rows, sample_fraction)
            .await?;
        let ranked = Self::rank_columns(&stats);

        for stat in &ranked {
            result.selected_columns.push(stat.name.clone());
            let fingerprint = FingerprintExpr::from_names(&result.selected_columns)?;
            let distinct = self
                .executor
                .execute(&Query::distinct_fingerprints(table, &fingerprint)?)
                .await?
                .count("distinct_count")?;
            let ratio = distinct as f64 / total_rows as f64;

            log_selection!(
                self.log_config,
                k = result.selected_columns.len(),
                column = %stat.name,
                distinct,
                ratio,
                "Appended key column"
            );

            result.selection_path.push(SelectionStep {
                k: result.selected_columns.len(),
                columns: result.selected_columns.clone(),
                distinct_count: distinct,
                ratio,
            });
            result.distinct_row_count = distinct;
            result.uniqueness_ratio = ratio;

            if ratio >= uniqueness_threshold {
                result.threshold_met = true;
                break;
            }
        }

        result.exact_unique = result.distinct_row_count == total_rows;
        result.column_stats = stats;

        if result.threshold_met {
            info!(
                columns = ?result.selected_columns,
                ratio = result.uniqueness_ratio,
                exact_unique = result.exact_unique,
                "Selected key"
            );
        } else {
            warn!(
                columns = result.selected_columns.len(),
                ratio = result.uniqueness_ratio,
                threshold = uniqueness_threshold,
                "Uniqueness threshold not reached, keeping best-effort key"
            );
        }

        self.persist(&result).await?;
        Ok(result)
    }

    /// Orders columns by descending cardinality ratio, then ascending null
    /// rate. Ties keep table order.
    pub fn rank_columns(stats: &[ColumnStat]) -> Vec<ColumnStat> {
        let mut ranked = stats.to_vec();
        ranked.sort_by(|a, b| {
            b.cardinality_ratio
                .total_cmp(&a.cardinality_ratio)
                .then_with(|| a.null_rate.total_cmp(&b.null_rate))
        });
        ranked
    }

    /// Counts groups of the full table grouped by the selected columns.
    pub async fn group_count(&self, result: &KeySelectionResult) -> Result<u64> {
        let idents = result
            .selected_columns
            .iter()
            .map(|c| Ident::from_schema(c.as_str()))
            .collect::<Result<Vec<_>>>()?;
        self.executor
            .execute(&Query::group_count(&result.table, &idents)?)
            .await?
            .count("group_count")
    }

    async fn persist(&self, result: &KeySelectionResult) -> Result<()> {
        self.audit
            .save_key_selection(result, self.config.persist_policy)
            .await
    }
}
