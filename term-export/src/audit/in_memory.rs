//! In-memory implementation of [`AuditRepository`] for tests and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use super::{AuditRepository, RunAuditRecord};
use crate::config::PersistPolicy;
use crate::error::Result;
use crate::selector::KeySelectionResult;
use crate::store::TableRef;

/// Keeps every record in memory behind a `tokio` lock.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryAuditRepository {
    selections: Arc<RwLock<HashMap<TableRef, Vec<KeySelectionResult>>>>,
    runs: Arc<RwLock<Vec<RunAuditRecord>>>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored key-selection records across all tables.
    pub async fn selection_count(&self) -> usize {
        self.selections.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    #[instrument(skip(self, result), fields(table = %result.table, repository_type = "in_memory"))]
    async fn save_key_selection(
        &self,
        result: &KeySelectionResult,
        policy: PersistPolicy,
    ) -> Result<()> {
        let mut store = self.selections.write().await;
        let records = store.entry(result.table.clone()).or_default();
        if policy == PersistPolicy::Overwrite {
            records.clear();
        }
        records.push(result.clone());
        Ok(())
    }

    async fn key_selections(&self, table: &TableRef) -> Result<Vec<KeySelectionResult>> {
        Ok(self
            .selections
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self, record), fields(run_id = %record.run_id, repository_type = "in_memory"))]
    async fn save_run(&self, record: &RunAuditRecord) -> Result<()> {
        self.runs.write().await.push(record.clone());
        Ok(())
    }

    async fn runs(&self) -> Result<Vec<RunAuditRecord>> {
        Ok(self.runs.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::sample_key_selection;

    #[tokio::test]
    async fn test_overwrite_and_append_policies() {
        let repo = InMemoryAuditRepository::new();
        let orders = sample_key_selection("orders", &["id"]);
        let other = sample_key_selection("customers", &["email"]);

        repo.save_key_selection(&orders, PersistPolicy::Append).await.unwrap();
        repo.save_key_selection(&orders, PersistPolicy::Append).await.unwrap();
        repo.save_key_selection(&other, PersistPolicy::Append).await.unwrap();
        assert_eq!(repo.key_selections(&orders.table).await.unwrap().len(), 2);

        repo.save_key_selection(&orders, PersistPolicy::Overwrite).await.unwrap();
        assert_eq!(repo.key_selections(&orders.table).await.unwrap().len(), 1);
        assert_eq!(repo.key_selections(&other.table).await.unwrap().len(), 1);
        assert_eq!(repo.selection_count().await, 2);
    }
}
