//! Prelude for commonly used types and traits in term-export.

pub use crate::audit::{
    AuditRepository, InMemoryAuditRepository, JsonLinesAuditRepository, RunAuditRecord,
};
pub use crate::config::{
    ExportConfig, KeyDiscoveryConfig, KeyLocation, PersistPolicy, ShardCount, ShardSizing,
};
pub use crate::crypto::{Decryptor, Keyring, MultiRecipientEncryptor, RecipientKey, RecipientSecret};
pub use crate::error::{ErrorContext, ExportError, Result};
pub use crate::extract::{BatchExtractor, OutputFormat};
pub use crate::fingerprint::{FieldValue, FingerprintEngine};
pub use crate::logging::LogConfig;
pub use crate::manifest::{ManifestBuilder, ManifestEntry};
pub use crate::notify::{Notifier, TracingNotifier};
pub use crate::pipeline::{PipelineDeps, PipelineOrchestrator, RunOutcome};
pub use crate::profiler::{ColumnProfiler, ColumnStat};
pub use crate::selector::{KeyColumnSelector, KeySelectionResult};
pub use crate::shard::{ShardDescriptor, ShardPlan, ShardPlanner};
pub use crate::store::{DataFusionStore, QueryExecutor, TableRef};
pub use crate::transfer::{BulkTransfer, ObjectStoreTransfer};
