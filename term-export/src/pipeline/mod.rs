//! Export orchestration.
//!
//! [`PipelineOrchestrator::run`] drives one export through its phases and
//! returns a [`RunOutcome`]. All per-run state lives in a [`RunContext`] that
//! is created at the start of the run and consumed at the end; nothing is
//! shared between runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use object_store::local::LocalFileSystem;
//! use term_export::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(DataFusionStore::new()?);
//! store
//!     .context()
//!     .register_csv("orders", "data/orders.csv", Default::default())
//!     .await?;
//!
//! let files = Arc::new(LocalFileSystem::new_with_prefix("/srv/export")?);
//! let deps = PipelineDeps {
//!     executor: store.clone(),
//!     transfer: Arc::new(ObjectStoreTransfer::new(files, store)),
//!     audit: Arc::new(InMemoryAuditRepository::new()),
//!     notifier: Arc::new(TracingNotifier),
//! };
//!
//! let config = ExportConfig::new(TableRef::bare("orders"), "orders")
//!     .with_recipient(KeyLocation::Local { path: "keys/ops.pub".into() })
//!     .with_shard_count(ShardCount::Fixed(8));
//!
//! match PipelineOrchestrator::new(config, deps).run().await {
//!     RunOutcome::Succeeded(summary) => println!("{} files", summary.files.len()),
//!     RunOutcome::Failed(failure) => eprintln!("{} in {}", failure.error, failure.phase),
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod orchestrator;
mod outcome;

pub use context::{CleanupWarning, LogEntry, LogLevel, Phase, RunContext, ScopedDir};
pub use orchestrator::{PipelineDeps, PipelineOrchestrator};
pub use outcome::{FailureSummary, InPhase, PhaseError, RunOutcome, RunSummary};
