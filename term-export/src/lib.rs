//! # term-export - Sharded, encrypted table export for Rust
//!
//! term-export moves large relational tables out of a data store as a set of
//! deterministically partitioned files, each encrypted once for a whole set
//! of recipients, together with a manifest of file names and row counts. A
//! separate key-discovery path finds a small set of columns that identifies
//! every row of a table. Query execution is built on DataFusion.
//!
//! ## Overview
//!
//! Two subsystems share one row fingerprint:
//!
//! - **Key discovery**: [`profiler::ColumnProfiler`] estimates per-column
//!   cardinality on a sample, and [`selector::KeyColumnSelector`] greedily
//!   grows a key from the best-ranked columns, verifying distinctness on the
//!   full table after every step.
//! - **Export**: [`shard::ShardPlanner`] assigns every row to
//!   `|fingerprint| mod n` shards, and [`pipeline::PipelineOrchestrator`]
//!   extracts, encrypts, and uploads each shard before writing the manifest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use term_export::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(DataFusionStore::new()?);
//! store
//!     .context()
//!     .register_csv("accounts", "data/accounts.csv", Default::default())
//!     .await?;
//! let audit = Arc::new(InMemoryAuditRepository::new());
//!
//! let selector = KeyColumnSelector::new(store, audit);
//! let result = selector
//!     .select_key(&TableRef::bare("accounts"), 0.02, 0.9999)
//!     .await?;
//!
//! println!(
//!     "key {:?} covers {} of {} rows",
//!     result.selected_columns, result.distinct_row_count, result.total_rows
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Features
//!
//! ### Deterministic sharding
//!
//! The fingerprint is a SHA-256 digest of a canonical, length-prefixed,
//! type-tagged encoding of the selected columns, exposed to SQL as the
//! `fingerprint` and `shard_of` functions. The same table always shards the
//! same way, and the shards partition it exactly.
//!
//! ### Multi-recipient encryption
//!
//! Each file is encrypted once under a random content key that is wrapped
//! for every recipient's X25519 key; any single recipient can decrypt. Keys
//! are imported into a keyring that lives only as long as the run.
//!
//! ### Failure handling
//!
//! Every fatal error aborts the run, then cleanup, the audit write, and the
//! failure notification happen in that order. The run returns a single
//! [`pipeline::RunOutcome`] describing what was produced or where it stopped.
//!
//! ## Logging
//!
//! All instrumentation goes through `tracing`; binaries install a subscriber
//! with [`logging::setup::init_logging`]. [`logging::LogConfig`] controls the
//! per-shard and per-step detail.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod logging;
pub mod manifest;
pub mod notify;
pub mod pipeline;
pub mod prelude;
pub mod profiler;
pub mod security;
pub mod selector;
pub mod shard;
pub mod store;
pub mod transfer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
