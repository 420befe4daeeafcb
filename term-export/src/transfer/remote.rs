//! [`BulkTransfer`] over an `object_store` backend.

use std::path::{Path as LocalPath, PathBuf};
use std::sync::Arc;

use arrow::csv::WriterBuilder;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use parquet::arrow::ArrowWriter;
use tracing::{debug, instrument};

use super::{join_remote, BulkTransfer};
use crate::error::{ExportError, Result};
use crate::extract::OutputFormat;
use crate::store::{Query, QueryExecutor, QueryResult};

/// Extracts through a [`QueryExecutor`] and moves files through an
/// [`ObjectStore`] (`InMemory` in tests, `LocalFileSystem` for the CLI, or a
/// cloud bucket).
pub struct ObjectStoreTransfer {
    store: Arc<dyn ObjectStore>,
    executor: Arc<dyn QueryExecutor>,
}

impl ObjectStoreTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, executor: Arc<dyn QueryExecutor>) -> Self {
        Self { store, executor }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn path(remote: &str) -> Result<Path> {
        Ok(Path::parse(remote.trim_matches('/')).map_err(object_store::Error::from)?)
    }

    fn encode(result: &QueryResult, format: &OutputFormat) -> Result<Vec<u8>> {
        match format {
            OutputFormat::Csv { delimiter, header } => {
                let mut writer = WriterBuilder::new()
                    .with_header(*header)
                    .with_delimiter(*delimiter)
                    .build(Vec::new());
                // An empty batch first so the header is written for empty shards
                writer.write(&RecordBatch::new_empty(Arc::clone(&result.schema)))?;
                for batch in &result.batches {
                    writer.write(batch)?;
                }
                Ok(writer.into_inner())
            }
            OutputFormat::Parquet => {
                let mut writer = ArrowWriter::try_new(Vec::new(), Arc::clone(&result.schema), None)?;
                for batch in &result.batches {
                    writer.write(batch)?;
                }
                Ok(writer.into_inner()?)
            }
        }
    }
}

#[async_trait]
impl BulkTransfer for ObjectStoreTransfer {
    #[instrument(skip(self, query, format), fields(remote = %remote))]
    async fn bulk_extract(
        &self,
        query: &Query,
        format: &OutputFormat,
        remote: &str,
    ) -> Result<Vec<String>> {
        let result = self.executor.execute(query).await?;
        let bytes = Self::encode(&result, format)?;
        let path = Self::path(remote)?;
        debug!(rows = result.num_rows(), bytes = bytes.len(), "Writing extract");
        self.store.put(&path, PutPayload::from(bytes)).await?;
        Ok(vec![path.to_string()])
    }

    async fn download(&self, remote: &str, local_dir: &LocalPath) -> Result<PathBuf> {
        let path = Self::path(remote).map_err(|e| ExportError::download(remote, e.to_string()))?;
        let file_name = path
            .filename()
            .ok_or_else(|| ExportError::download(remote, "path has no file name"))?
            .to_string();
        let bytes = self
            .store
            .get(&path)
            .await
            .map_err(|e| ExportError::download(remote, e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ExportError::download(remote, e.to_string()))?;

        let local = local_dir.join(file_name);
        tokio::fs::write(&local, &bytes)
            .await
            .map_err(|e| ExportError::download(remote, e.to_string()))?;
        debug!(remote, local = %local.display(), bytes = bytes.len(), "Downloaded");
        Ok(local)
    }

    async fn upload(&self, local: &LocalPath, remote: &str, overwrite: bool) -> Result<()> {
        let path = Self::path(remote).map_err(|e| ExportError::upload(remote, e.to_string()))?;
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| ExportError::upload(remote, format!("{}: {e}", local.display())))?;
        let size = bytes.len();
        let opts = if overwrite {
            PutOptions::default()
        } else {
            PutOptions::from(PutMode::Create)
        };
        self.store
            .put_opts(&path, PutPayload::from(bytes), opts)
            .await
            .map_err(|e| match e {
                object_store::Error::AlreadyExists { .. } => {
                    ExportError::upload(remote, "object exists and overwrite is disabled")
                }
                other => ExportError::upload(remote, other.to_string()),
            })?;
        debug!(remote, bytes = size, "Uploaded");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Self::path(prefix)?;
        let mut paths: Vec<String> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        paths.sort();
        Ok(paths)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match self.store.delete(&Self::path(path)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self, prefix: &str) -> Result<()> {
        let access = |e: ExportError| ExportError::access(prefix, e.to_string());
        self.list(prefix).await.map_err(access)?;

        let marker = join_remote(prefix, &format!(".probe-{}", uuid::Uuid::new_v4().simple()));
        let marker = Self::path(&marker).map_err(access)?;
        self.store
            .put(&marker, PutPayload::from_static(b"probe"))
            .await
            .map_err(|e| access(e.into()))?;
        self.store
            .delete(&marker)
            .await
            .map_err(|e| access(e.into()))?;
        Ok(())
    }
}
