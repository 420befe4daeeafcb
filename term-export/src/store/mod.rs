//! The data store collaborator.
//!
//! The core only needs a handful of capabilities from the store: exact row
//! counts, column introspection, approximate distinct counting, and the
//! `fingerprint`/`shard_of` primitives. [`QueryExecutor`] is the seam; the
//! shipped implementation is [`DataFusionStore`].

use arrow::array::{Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

use crate::error::{ExportError, Result};

pub mod query;
pub mod session;
pub mod udf;

pub use query::{FingerprintExpr, Ident, Literal, Query, QueryKind, TableRef};
pub use session::{DataFusionStore, StoreConfig};

/// Rows returned by a query, with the schema even when no rows came back.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Reads an integer column across all batches as `i64`, casting from
    /// whatever integer type the engine produced.
    pub fn i64_column(&self, column: &str) -> Result<Vec<Option<i64>>> {
        let mut values = Vec::with_capacity(self.num_rows());
        for batch in &self.batches {
            let array = batch.column_by_name(column).ok_or_else(|| {
                ExportError::Internal(format!("query result has no column '{column}'"))
            })?;
            let array = cast(array, &DataType::Int64)?;
            let ints = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| ExportError::Internal(format!("column '{column}' is not BIGINT")))?;
            values.extend((0..ints.len()).map(|i| (!ints.is_null(i)).then(|| ints.value(i))));
        }
        Ok(values)
    }

    /// Reads the first row of a non-negative count column.
    pub fn count(&self, column: &str) -> Result<u64> {
        let value = self
            .i64_column(column)?
            .into_iter()
            .next()
            .flatten()
            .unwrap_or(0);
        u64::try_from(value)
            .map_err(|_| ExportError::Internal(format!("column '{column}' is negative: {value}")))
    }
}

/// Executes queries against the source data store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a statement and collects its rows.
    async fn execute(&self, query: &Query) -> Result<QueryResult>;

    /// Returns the ordered column names of a table.
    ///
    /// # Errors
    ///
    /// [`ExportError::Access`] when the table cannot be resolved.
    async fn columns(&self, table: &TableRef) -> Result<Vec<String>>;

    /// Draws a sample of approximately `fraction` of `table` and registers
    /// it as a temporary table called `name`.
    async fn register_sample(&self, table: &TableRef, fraction: f64, name: &str)
        -> Result<TableRef>;

    /// Removes a temporary table registered by [`Self::register_sample`].
    async fn deregister(&self, table: &TableRef) -> Result<()>;
}
