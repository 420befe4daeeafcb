//! Sampled column profiling for key discovery.
//!
//! All columns of a table are profiled from one shared sample in a single
//! aggregate query, so cost scales with the sample rather than with the table
//! or its width. Distinct counts are approximate (HyperLogLog); they only rank
//! columns, the key decision itself is verified exactly on the full table.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use term_export::profiler::ColumnProfiler;
//! use term_export::store::{DataFusionStore, TableRef};
//! use term_export::test_fixtures::create_unique_pair_context;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = DataFusionStore::from_context(create_unique_pair_context(100).await.unwrap());
//! let profiler = ColumnProfiler::builder(Arc::new(store))
//!     .min_sample_rows(10_000)
//!     .build();
//!
//! let stat = profiler
//!     .profile(&TableRef::bare("accounts"), "seq", 0.02)
//!     .await
//!     .unwrap();
//! println!("{}: ~{} distinct", stat.name, stat.approx_distinct_count);
//! # })
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_MIN_SAMPLE_ROWS;
use crate::error::{ExportError, Result};
use crate::security::InputValidator;
use crate::store::query::profile_aliases;
use crate::store::{Ident, Query, QueryExecutor, TableRef};

/// Sampled statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStat {
    pub name: String,
    /// Approximate distinct non-null values in the sample
    pub approx_distinct_count: u64,
    /// Fraction of sampled rows where the column is null
    pub null_rate: f64,
    /// `approx_distinct_count / total_rows`
    pub cardinality_ratio: f64,
    /// Rows the statistics were computed from
    pub sample_rows: u64,
}

/// Configuration for [`ColumnProfiler`].
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Tables with at most this many rows are profiled without sampling
    pub min_sample_rows: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            min_sample_rows: DEFAULT_MIN_SAMPLE_ROWS,
        }
    }
}

/// Builder for [`ColumnProfiler`].
pub struct ColumnProfilerBuilder {
    executor: Arc<dyn QueryExecutor>,
    config: ProfilerConfig,
}

impl ColumnProfilerBuilder {
    /// Set the row count below which tables are profiled in full
    pub fn min_sample_rows(mut self, rows: u64) -> Self {
        self.config.min_sample_rows = rows;
        self
    }

    pub fn config(mut self, config: ProfilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ColumnProfiler {
        ColumnProfiler {
            executor: self.executor,
            config: self.config,
        }
    }
}

/// Computes approximate cardinality and null rates per column.
pub struct ColumnProfiler {
    executor: Arc<dyn QueryExecutor>,
    config: ProfilerConfig,
}

impl ColumnProfiler {
    pub fn builder(executor: Arc<dyn QueryExecutor>) -> ColumnProfilerBuilder {
        ColumnProfilerBuilder {
            executor,
            config: ProfilerConfig::default(),
        }
    }

    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self::builder(executor).build()
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Profiles a single column.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn profile(
        &self,
        table: &TableRef,
        column: &str,
        sample_fraction: f64,
    ) -> Result<ColumnStat> {
        let total_rows = self
            .executor
            .execute(&Query::row_count(table)?)
            .await?
            .count("row_count")?;
        let mut stats = self
            .profile_columns(table, &[column.to_string()], total_rows, sample_fraction)
            .await?;
        stats
            .pop()
            .ok_or_else(|| ExportError::Internal(format!("no statistics for column '{column}'")))
    }

    /// Profiles every column in `columns` from one shared sample.
    ///
    /// `total_rows` is the exact row count of `table`; it picks between
    /// sampling and a full pass and is the denominator of the cardinality
    /// ratio.
    #[instrument(skip(self, columns), fields(table = %table, columns = columns.len()))]
    pub async fn profile_columns(
        &self,
        table: &TableRef,
        columns: &[String],
        total_rows: u64,
        sample_fraction: f64,
    ) -> Result<Vec<ColumnStat>> {
        InputValidator::validate_fraction(sample_fraction, "sample_fraction")?;
        let idents = columns
            .iter()
            .map(|c| Ident::from_schema(c.as_str()))
            .collect::<Result<Vec<_>>>()?;

        if total_rows == 0 || idents.is_empty() {
            return Ok(columns.iter().map(|c| empty_stat(c)).collect());
        }

        let sampled = total_rows > self.config.min_sample_rows && sample_fraction < 1.0;
        let result = if sampled {
            let name = format!("__term_export_sample_{}", uuid::Uuid::new_v4().simple());
            let sample = self
                .executor
                .register_sample(table, sample_fraction, &name)
                .await?;
            let result = self
                .executor
                .execute(&Query::profile(&sample, &idents)?)
                .await;
            if let Err(e) = self.executor.deregister(&sample).await {
                warn!(sample = %sample, error = %e, "Failed to drop sample table");
            }
            let result = result?;
            if result.count("sample_rows")? == 0 {
                warn!("Sample came back empty, profiling the full table");
                self.executor
                    .execute(&Query::profile(table, &idents)?)
                    .await?
            } else {
                result
            }
        } else {
            debug!(total_rows, "Table below sampling threshold, profiling in full");
            self.executor
                .execute(&Query::profile(table, &idents)?)
                .await?
        };

        let sample_rows = result.count("sample_rows")?;
        let mut stats = Vec::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let (ndv_alias, non_null_alias) = profile_aliases(i);
            let approx_distinct_count = result.count(&ndv_alias)?;
            let non_null = result.count(&non_null_alias)?;
            let null_rate = if sample_rows == 0 {
                0.0
            } else {
                1.0 - non_null as f64 / sample_rows as f64
            };
            stats.push(ColumnStat {
                name: name.clone(),
                approx_distinct_count,
                null_rate,
                cardinality_ratio: approx_distinct_count as f64 / total_rows as f64,
                sample_rows,
            });
        }

        info!(sampled, sample_rows, total_rows, "Profiled columns");
        Ok(stats)
    }
}

fn empty_stat(name: &str) -> ColumnStat {
    ColumnStat {
        name: name.to_string(),
        approx_distinct_count: 0,
        null_rate: 0.0,
        cardinality_ratio: 0.0,
        sample_rows: 0,
    }
}
