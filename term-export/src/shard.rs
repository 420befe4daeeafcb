//! Fingerprint-based shard planning.
//!
//! A row belongs to shard `|fingerprint| mod n_shards`. The absolute value is
//! taken with [`i64::unsigned_abs`], so `i64::MIN` maps cleanly instead of
//! overflowing. The same function backs the `shard_of` SQL function, which is
//! what extraction filters on, so planning and extraction cannot disagree.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ExportError, Result};
use crate::store::{FingerprintExpr, Query, QueryExecutor, TableRef};

/// One shard of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: u32,
    pub n_shards: u32,
    /// Rows in the shard, when counts were collected
    pub row_count: Option<u64>,
}

impl ShardDescriptor {
    /// Human-readable predicate, for logs.
    pub fn predicate(&self) -> String {
        format!("fingerprint mod {} == {}", self.n_shards, self.shard_id)
    }
}

/// The partitioning of one table into shards.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub table: TableRef,
    pub fingerprint: FingerprintExpr,
    pub n_shards: u32,
    pub shards: Vec<ShardDescriptor>,
}

impl ShardPlan {
    /// The statement selecting exactly the rows of `shard`.
    pub fn extract_query(&self, shard: &ShardDescriptor) -> Result<Query> {
        Query::shard_extract(&self.table, &self.fingerprint, self.n_shards, shard.shard_id)
    }

    /// Sum of per-shard counts, when they were collected.
    pub fn counted_rows(&self) -> Option<u64> {
        self.shards.iter().map(|s| s.row_count).sum()
    }

    /// Largest shard divided by the mean shard size, when counts were
    /// collected and the table is not empty.
    pub fn skew(&self) -> Option<f64> {
        let counts: Vec<u64> = self.shards.iter().map(|s| s.row_count).collect::<Option<_>>()?;
        let total: u64 = counts.iter().sum();
        let max = counts.iter().copied().max()?;
        if total == 0 {
            return None;
        }
        let mean = total as f64 / counts.len() as f64;
        Some(max as f64 / mean)
    }
}

/// Maps fingerprints to shards and plans table partitioning.
pub struct ShardPlanner {
    executor: Arc<dyn QueryExecutor>,
}

impl ShardPlanner {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// `|fingerprint| mod n_shards`.
    ///
    /// ```rust
    /// use term_export::shard::ShardPlanner;
    ///
    /// assert_eq!(ShardPlanner::shard_of(-7, 3).unwrap(), 1);
    /// assert_eq!(ShardPlanner::shard_of(i64::MIN, 256).unwrap(), 0);
    /// assert!(ShardPlanner::shard_of(1, 0).is_err());
    /// ```
    pub fn shard_of(fingerprint: i64, n_shards: u32) -> Result<u32> {
        if n_shards == 0 {
            return Err(ExportError::Configuration(
                "shard count must be at least 1".to_string(),
            ));
        }
        // The remainder is below n_shards, which fits in u32
        Ok((fingerprint.unsigned_abs() % u64::from(n_shards)) as u32)
    }

    /// Row count per shard id, `0..n_shards`, including empty shards.
    #[instrument(skip(self, fingerprint), fields(table = %table))]
    pub async fn shard_counts(
        &self,
        table: &TableRef,
        fingerprint: &FingerprintExpr,
        n_shards: u32,
    ) -> Result<Vec<(u32, u64)>> {
        let result = self
            .executor
            .execute(&Query::shard_counts(table, fingerprint, n_shards)?)
            .await?;

        let mut counts: Vec<(u32, u64)> = (0..n_shards).map(|id| (id, 0)).collect();
        let ids = result.i64_column("shard_id")?;
        let rows = result.i64_column("row_count")?;
        for (id, rows) in ids.into_iter().zip(rows) {
            let (Some(id), Some(rows)) = (id, rows) else {
                continue;
            };
            let slot = usize::try_from(id)
                .ok()
                .and_then(|i| counts.get_mut(i))
                .ok_or_else(|| ExportError::Internal(format!("shard id {id} out of range")))?;
            slot.1 = u64::try_from(rows).unwrap_or(0);
        }
        Ok(counts)
    }

    /// Plans `n_shards` shards over `table`, optionally with row counts.
    #[instrument(skip(self, fingerprint), fields(table = %table))]
    pub async fn plan(
        &self,
        table: &TableRef,
        fingerprint: FingerprintExpr,
        n_shards: u32,
        with_counts: bool,
    ) -> Result<ShardPlan> {
        Self::shard_of(0, n_shards)?;

        let shards = if with_counts {
            self.shard_counts(table, &fingerprint, n_shards)
                .await?
                .into_iter()
                .map(|(shard_id, rows)| ShardDescriptor {
                    shard_id,
                    n_shards,
                    row_count: Some(rows),
                })
                .collect()
        } else {
            (0..n_shards)
                .map(|shard_id| ShardDescriptor {
                    shard_id,
                    n_shards,
                    row_count: None,
                })
                .collect()
        };

        let plan = ShardPlan {
            table: table.clone(),
            fingerprint,
            n_shards,
            shards,
        };

        match plan.skew() {
            Some(skew) if skew > 2.0 => {
                warn!(n_shards, skew, "Shard sizes are skewed");
            }
            skew => info!(n_shards, ?skew, "Planned shards"),
        }
        Ok(plan)
    }
}
