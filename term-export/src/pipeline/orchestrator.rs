//! The export state machine.
//!
//! ```text
//! Validating -> KeySetup -> Analyzing -> Shard(0..n) -> Finalizing -> Succeeded
//!      \____________\____________\___________\______________\_____-> Failed
//! ```
//!
//! Every fatal error aborts the run. Teardown then happens in a fixed order:
//! best-effort cleanup, the audit write, and one notification per configured
//! recipient. A failing teardown step is logged and never replaces the
//! original error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, TryStreamExt};
use tracing::{info, instrument};

use super::context::{Phase, RunContext};
use super::outcome::{FailureSummary, InPhase, PhaseError, RunOutcome, RunSummary};
use crate::audit::AuditRepository;
use crate::config::{ExportConfig, KeyLocation};
use crate::crypto::{Keyring, MultiRecipientEncryptor, RecipientKey};
use crate::error::{ExportError, Result};
use crate::extract::{output_file_name, BatchExtractor, OutputFormat};
use crate::log_data_op;
use crate::logging::{truncate_field, LogConfig};
use crate::manifest::{count_data_rows, manifest_file_name, ManifestBuilder};
use crate::notify::Notifier;
use crate::shard::{ShardDescriptor, ShardPlan, ShardPlanner};
use crate::store::{FingerprintExpr, Query, QueryExecutor};
use crate::transfer::{join_remote, BulkTransfer};

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub executor: Arc<dyn QueryExecutor>,
    pub transfer: Arc<dyn BulkTransfer>,
    pub audit: Arc<dyn AuditRepository>,
    pub notifier: Arc<dyn Notifier>,
}

/// State carried from Analyzing into the shard and final phases.
struct Analysis {
    total_rows: u64,
    format: OutputFormat,
    plan: ShardPlan,
}

/// Results of a run that reached Finalizing.
struct Artifacts {
    n_shards: u32,
    total_rows: u64,
    manifest: Option<String>,
}

/// Runs one export from validation to notification.
pub struct PipelineOrchestrator {
    config: ExportConfig,
    deps: PipelineDeps,
    encryptor: MultiRecipientEncryptor,
    log_config: LogConfig,
}

impl PipelineOrchestrator {
    pub fn new(config: ExportConfig, deps: PipelineDeps) -> Self {
        let encryptor = MultiRecipientEncryptor::new().with_armor(config.armor);
        Self {
            config,
            deps,
            encryptor,
            log_config: LogConfig::default(),
        }
    }

    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = log_config;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Runs the export. Never returns an error: failures are reported in the
    /// outcome, after cleanup, audit and notification.
    #[instrument(skip(self), fields(table = %self.config.table))]
    pub async fn run(&self) -> RunOutcome {
        let ctx = RunContext::new();
        ctx.info(Phase::Validating, format!("Run {} started", ctx.run_id()));

        let mut keyring: Option<Keyring> = None;
        let result = self.execute(&ctx, &mut keyring).await;

        let recipients = keyring
            .as_ref()
            .map(Keyring::identities)
            .unwrap_or_default();
        let end_phase = match &result {
            Ok(_) => Phase::Succeeded,
            Err(e) => {
                ctx.error(e.phase, format!("{}: {}", e.error.kind(), e.error));
                Phase::Failed
            }
        };

        // Cleanup
        if let Err(PhaseError { phase, .. }) = &result {
            if *phase != Phase::Validating {
                self.clear_staging(&ctx, Phase::Failed).await;
            }
        }
        if let Some(keyring) = keyring.take() {
            let home = keyring.home().display().to_string();
            if let Err(e) = keyring.close() {
                ctx.cleanup_warning(end_phase, home, e.to_string());
            }
        }
        ctx.sweep(end_phase);

        let outcome = self.outcome(&ctx, result, recipients);

        // Audit
        if let Err(e) = self.deps.audit.save_run(&outcome.audit_record()).await {
            ctx.warn(end_phase, format!("Audit write failed: {e}"));
        }

        // Notification
        let (subject, body) = outcome.notification();
        for recipient in &self.config.notify_recipients {
            if let Err(e) = self.deps.notifier.notify(recipient, &subject, &body).await {
                ctx.warn(end_phase, format!("Notification to {recipient} failed: {e}"));
            }
        }

        match &outcome {
            RunOutcome::Succeeded(s) => info!(
                run_id = %s.run_id,
                files = s.files.len(),
                rows = s.rows_exported,
                "Export succeeded"
            ),
            RunOutcome::Failed(f) => info!(
                run_id = %f.run_id,
                phase = %f.phase,
                kind = f.error_kind(),
                error = %truncate_field(&f.error.to_string(), self.log_config.max_field_length),
                "Export failed"
            ),
        }

        // Rebuild with the complete log, including teardown warnings
        let log = ctx.entries();
        match outcome {
            RunOutcome::Succeeded(mut s) => {
                s.log = log;
                RunOutcome::Succeeded(s)
            }
            RunOutcome::Failed(mut f) => {
                f.log = log;
                RunOutcome::Failed(f)
            }
        }
    }

    fn outcome(
        &self,
        ctx: &RunContext,
        result: std::result::Result<Artifacts, PhaseError>,
        recipients: Vec<String>,
    ) -> RunOutcome {
        let finished_at = Utc::now();
        match result {
            Ok(artifacts) => RunOutcome::Succeeded(RunSummary {
                run_id: ctx.run_id().to_string(),
                table: self.config.table.clone(),
                files: ctx.files(),
                manifest: artifacts.manifest,
                n_shards: artifacts.n_shards,
                total_rows: artifacts.total_rows,
                rows_exported: ctx.rows_exported(),
                recipients,
                log: ctx.entries(),
                started_at: ctx.started_at(),
                finished_at,
            }),
            Err(PhaseError { phase, error }) => RunOutcome::Failed(FailureSummary {
                run_id: ctx.run_id().to_string(),
                table: self.config.table.clone(),
                phase,
                error,
                files: ctx.files(),
                rows_exported: ctx.rows_exported(),
                recipients,
                log: ctx.entries(),
                started_at: ctx.started_at(),
                finished_at,
            }),
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        keyring: &mut Option<Keyring>,
    ) -> std::result::Result<Artifacts, PhaseError> {
        let columns = self.validate(ctx).await.in_phase(Phase::Validating)?;

        let keys = self
            .setup_keys(ctx, keyring)
            .await
            .in_phase(Phase::KeySetup)?;

        let analysis = self
            .analyze(ctx, &columns)
            .await
            .in_phase(Phase::Analyzing)?;

        let manifest = ManifestBuilder::new();
        let extractor = BatchExtractor::new(
            Arc::clone(&self.deps.transfer),
            self.config.stage_prefix.as_str(),
        );
        let timestamp = ctx.started_at();

        stream::iter(analysis.plan.shards.iter().map(Ok))
            .try_for_each_concurrent(self.config.max_concurrent_shards, |shard| {
                let phase = Phase::Shard(shard.shard_id);
                let work = self.process_shard(
                    ctx,
                    &extractor,
                    &analysis,
                    shard,
                    &keys,
                    &manifest,
                    timestamp,
                );
                async move { work.await.in_phase(phase) }
            })
            .await?;

        let manifest = self
            .finalize(ctx, &manifest, timestamp)
            .await
            .in_phase(Phase::Finalizing)?;

        Ok(Artifacts {
            n_shards: analysis.plan.n_shards,
            total_rows: analysis.total_rows,
            manifest,
        })
    }

    /// Source readable, stage and output reachable, staging cleared.
    /// Returns the table's columns.
    async fn validate(&self, ctx: &RunContext) -> Result<Vec<String>> {
        self.config.validate()?;
        let table = &self.config.table;

        let columns = self.deps.executor.columns(table).await?;
        if columns.is_empty() {
            return Err(ExportError::schema(table.to_string(), "table has no columns"));
        }
        self.deps
            .executor
            .execute(&Query::probe(table)?)
            .await
            .map_err(|e| ExportError::access(table.to_string(), e.to_string()))?;

        self.deps.transfer.probe(&self.config.stage_prefix).await?;
        self.deps.transfer.probe(&self.config.output_prefix).await?;

        let cleared = self
            .deps
            .transfer
            .clear(&self.config.stage_prefix)
            .await
            .map_err(|e| ExportError::access(self.config.stage_prefix.as_str(), e.to_string()))?;
        ctx.info(
            Phase::Validating,
            format!(
                "Validated {table} ({} columns), cleared {cleared} staged files",
                columns.len()
            ),
        );
        Ok(columns)
    }

    /// Imports every recipient key into a fresh keyring.
    async fn setup_keys(
        &self,
        ctx: &RunContext,
        slot: &mut Option<Keyring>,
    ) -> Result<Vec<RecipientKey>> {
        let keyring = slot.insert(Keyring::create()?);

        for location in &self.config.recipient_keys {
            match location {
                KeyLocation::Remote { path } => {
                    let dir = ctx.scoped_dir("key")?;
                    let local = self
                        .deps
                        .transfer
                        .download(path, dir.path())
                        .await
                        .map_err(|e| ExportError::key_import(path.as_str(), e.to_string()))?;
                    keyring.import_file(&local)?;
                }
                KeyLocation::Local { path } => {
                    keyring.import_file(path)?;
                }
                KeyLocation::Inline { material } => {
                    keyring.import(&location.label(), material)?;
                }
            }
        }

        ctx.info(
            Phase::KeySetup,
            format!(
                "Imported {} recipient keys for {}",
                keyring.recipients().len(),
                keyring.identities().join(", ")
            ),
        );
        Ok(keyring.recipients().to_vec())
    }

    async fn analyze(&self, ctx: &RunContext, columns: &[String]) -> Result<Analysis> {
        let table = &self.config.table;
        let total_rows = self
            .deps
            .executor
            .execute(&Query::row_count(table)?)
            .await?
            .count("row_count")?;
        ctx.set_expected_rows(total_rows);

        let format = OutputFormat::parse(
            &self.config.output_format,
            self.config.delimiter.as_deref(),
            self.config.include_header,
        )?;

        let fingerprint_columns = if self.config.fingerprint_columns.is_empty() {
            columns.to_vec()
        } else {
            for column in &self.config.fingerprint_columns {
                if !columns.contains(column) {
                    return Err(ExportError::schema(
                        table.to_string(),
                        format!("fingerprint column '{column}' does not exist"),
                    ));
                }
            }
            self.config.fingerprint_columns.clone()
        };
        let fingerprint = FingerprintExpr::from_names(&fingerprint_columns)?;

        let n_shards = self.config.shard_count.resolve(total_rows);
        let plan = ShardPlanner::new(Arc::clone(&self.deps.executor))
            .plan(table, fingerprint, n_shards, self.config.collect_shard_counts)
            .await?;

        if let Some(counted) = plan.counted_rows() {
            if counted != total_rows {
                ctx.warn(
                    Phase::Analyzing,
                    format!("Shard counts sum to {counted} but the table has {total_rows} rows"),
                );
            }
        }

        ctx.info(
            Phase::Analyzing,
            format!(
                "{total_rows} rows, {} output, {n_shards} shards over {} fingerprint columns",
                format.extension(),
                fingerprint_columns.len()
            ),
        );
        Ok(Analysis {
            total_rows,
            format,
            plan,
        })
    }

    /// extract, download, count, encrypt, upload, record.
    #[allow(clippy::too_many_arguments)]
    async fn process_shard(
        &self,
        ctx: &RunContext,
        extractor: &BatchExtractor,
        analysis: &Analysis,
        shard: &ShardDescriptor,
        recipients: &[RecipientKey],
        manifest: &ManifestBuilder,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let phase = Phase::Shard(shard.shard_id);
        let format = &analysis.format;
        let file_name = output_file_name(&self.config.file_prefix, timestamp, shard.shard_id, format);

        let staged = extractor
            .extract(&analysis.plan, shard, format, &file_name)
            .await?;
        log_data_op!(self.log_config, shard_id = shard.shard_id, staged = %staged, "Extracted shard");

        let dir = ctx.scoped_dir("shard")?;
        let local = self.deps.transfer.download(&staged, dir.path()).await?;

        let rows = if format.supports_row_count() {
            count_data_rows(&local, format.has_header())
        } else {
            parquet_rows(&local)
        }
        .map_err(|e| ExportError::download(staged.as_str(), format!("cannot read local copy: {e}")))?;

        let encrypted_name = format!("{file_name}.{}", self.config.encrypted_suffix);
        let encrypted = dir.path().join(&encrypted_name);
        self.encryptor
            .encrypt_file(&local, &encrypted, recipients)
            .await?;

        let remote = join_remote(&self.config.output_prefix, &encrypted_name);
        self.deps
            .transfer
            .upload(&encrypted, &remote, self.config.overwrite)
            .await?;
        log_data_op!(self.log_config, shard_id = shard.shard_id, rows, remote = %remote, "Uploaded shard");

        if format.supports_row_count() {
            manifest.add(encrypted_name.as_str(), rows)?;
        }
        ctx.record_file(remote, rows);
        ctx.info(phase, format!("{encrypted_name}: {rows} rows"));

        if let Err(e) = self.deps.transfer.remove(&staged).await {
            ctx.cleanup_warning(phase, staged, e.to_string());
        }
        Ok(())
    }

    /// Uploads the manifest and clears staging.
    async fn finalize(
        &self,
        ctx: &RunContext,
        manifest: &ManifestBuilder,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let uploaded = match manifest.render()? {
            Some(text) => {
                let name = manifest_file_name(&self.config.file_prefix, timestamp);
                let remote = join_remote(&self.config.output_prefix, &name);
                let dir = ctx.scoped_dir("manifest")?;
                let local = dir.path().join(&name);
                tokio::fs::write(&local, text)
                    .await
                    .map_err(|e| ExportError::Manifest(format!("cannot write {name}: {e}")))?;
                self.deps
                    .transfer
                    .upload(&local, &remote, self.config.overwrite)
                    .await
                    .map_err(|e| ExportError::Manifest(e.to_string()))?;
                ctx.info(
                    Phase::Finalizing,
                    format!("Manifest {name} lists {} files", manifest.len()),
                );
                Some(remote)
            }
            None => {
                ctx.info(Phase::Finalizing, "No manifest entries, manifest skipped");
                None
            }
        };

        self.clear_staging(ctx, Phase::Finalizing).await;
        Ok(uploaded)
    }

    async fn clear_staging(&self, ctx: &RunContext, phase: Phase) {
        if let Err(e) = self.deps.transfer.clear(&self.config.stage_prefix).await {
            ctx.cleanup_warning(phase, self.config.stage_prefix.as_str(), e.to_string());
        }
    }
}

fn parquet_rows(path: &std::path::Path) -> Result<u64> {
    use parquet::file::reader::{FileReader, SerializedFileReader};

    let reader = SerializedFileReader::new(std::fs::File::open(path)?)?;
    Ok(u64::try_from(reader.metadata().file_metadata().num_rows()).unwrap_or(0))
}
