//! DataFusion-backed [`QueryExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::common::TableReference;
use datafusion::datasource::MemTable;
use datafusion::execution::context::{SessionConfig, SessionContext};
use datafusion::execution::memory_pool::{FairSpillPool, MemoryPool};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use tracing::{debug, instrument};

use super::query::{Query, TableRef};
use super::udf::export_udfs;
use super::{QueryExecutor, QueryResult};
use crate::error::{ExportError, Result};
use crate::security::SqlSecurity;

/// Configuration for the DataFusion session behind a [`DataFusionStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Target number of partitions for parallel execution
    pub target_partitions: usize,
    /// Maximum memory for query execution (in bytes)
    pub max_memory: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            max_memory: 2 * 1024 * 1024 * 1024, // 2GB
        }
    }
}

/// A [`QueryExecutor`] over a DataFusion [`SessionContext`].
///
/// Sources are registered on the context directly (CSV, Parquet, in-memory
/// tables); the store adds the `fingerprint` and `shard_of` functions.
///
/// ```rust,no_run
/// use term_export::store::{DataFusionStore, QueryExecutor, Query, TableRef};
///
/// # async fn example() -> term_export::error::Result<()> {
/// let store = DataFusionStore::new()?;
/// store
///     .context()
///     .register_csv("orders", "data/orders.csv", Default::default())
///     .await?;
///
/// let rows = store
///     .execute(&Query::row_count(&TableRef::bare("orders"))?)
///     .await?
///     .count("row_count")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DataFusionStore {
    ctx: SessionContext,
}

impl DataFusionStore {
    /// Creates a store with default configuration.
    #[instrument]
    pub fn new() -> Result<Self> {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a store with a bounded, spill-capable memory pool.
    #[instrument(skip(config))]
    pub fn with_config(config: StoreConfig) -> Result<Self> {
        let session_config = SessionConfig::new()
            .with_batch_size(config.batch_size)
            .with_target_partitions(config.target_partitions)
            .with_information_schema(true);

        let memory_pool = Arc::new(FairSpillPool::new(config.max_memory)) as Arc<dyn MemoryPool>;

        let runtime_env = RuntimeEnvBuilder::new()
            .with_memory_pool(memory_pool)
            .build()
            .map(Arc::new)?;

        let ctx = SessionContext::new_with_config_rt(session_config, runtime_env);
        Ok(Self::from_context(ctx))
    }

    /// Wraps an existing context, registering the export functions on it.
    pub fn from_context(ctx: SessionContext) -> Self {
        for udf in export_udfs() {
            ctx.register_udf(udf);
        }
        Self { ctx }
    }

    /// The underlying DataFusion context, for registering sources.
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    fn reference(table: &TableRef) -> Result<TableReference> {
        match (&table.catalog, &table.schema) {
            (Some(catalog), Some(schema)) => Ok(TableReference::full(
                catalog.as_str(),
                schema.as_str(),
                table.table.as_str(),
            )),
            (None, Some(schema)) => Ok(TableReference::partial(
                schema.as_str(),
                table.table.as_str(),
            )),
            (None, None) => Ok(TableReference::bare(table.table.as_str())),
            (Some(_), None) => Err(ExportError::Configuration(format!(
                "table reference '{table}' has a catalog but no schema"
            ))),
        }
    }
}

#[async_trait]
impl QueryExecutor for DataFusionStore {
    #[instrument(skip(self, query), fields(kind = ?query.kind()))]
    async fn execute(&self, query: &Query) -> Result<QueryResult> {
        debug!(sql = query.sql(), "Executing query");
        let df = self.ctx.sql(query.sql()).await?;
        let schema = Arc::clone(df.schema().inner());
        let batches = df.collect().await?;
        Ok(QueryResult { schema, batches })
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn columns(&self, table: &TableRef) -> Result<Vec<String>> {
        table.validate()?;
        let df = self
            .ctx
            .table(Self::reference(table)?)
            .await
            .map_err(|e| ExportError::access(table.to_string(), e.to_string()))?;
        Ok(df
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect())
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn register_sample(
        &self,
        table: &TableRef,
        fraction: f64,
        name: &str,
    ) -> Result<TableRef> {
        SqlSecurity::validate_identifier(name)?;
        let sample = self.execute(&Query::sample(table, fraction)?).await?;
        let rows = sample.num_rows();
        let provider = MemTable::try_new(sample.schema, vec![sample.batches])?;
        self.ctx
            .register_table(TableReference::bare(name), Arc::new(provider))?;
        debug!(sample = name, rows, "Registered sample table");
        Ok(TableRef::bare(name))
    }

    async fn deregister(&self, table: &TableRef) -> Result<()> {
        self.ctx.deregister_table(Self::reference(table)?)?;
        Ok(())
    }
}
