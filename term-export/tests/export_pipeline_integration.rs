//! End-to-end export runs over an in-memory object store.
//!
//! Each test builds the full collaborator set: a DataFusion store holding the
//! fixture table, an [`ObjectStoreTransfer`] over `InMemory`, an in-memory
//! audit repository, and a notifier that records what it was asked to send.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use object_store::memory::InMemory;
use parquet::file::reader::{FileReader, SerializedFileReader};
use term_export::audit::{AuditRepository, InMemoryAuditRepository, RunAuditRecord, RunStatus};
use term_export::config::{ExportConfig, KeyLocation, PersistPolicy, ShardCount};
use term_export::crypto::{Decryptor, RecipientKey, RecipientSecret};
use term_export::error::{ExportError, Result};
use term_export::extract::OutputFormat;
use term_export::manifest::ManifestBuilder;
use term_export::notify::{Notification, Notifier};
use term_export::pipeline::{LogLevel, Phase, PipelineDeps, PipelineOrchestrator, RunOutcome};
use term_export::selector::{KeyColumnSelector, KeySelectionResult};
use term_export::store::{DataFusionStore, Query, TableRef};
use term_export::test_fixtures::{create_unique_pair_context, recipient_pair};
use term_export::transfer::{BulkTransfer, ObjectStoreTransfer};

/// Forwards to a real transfer, records traffic, and injects faults.
#[derive(Default)]
struct Faults {
    /// Zero-based index of the upload call that fails
    fail_upload_at: Option<usize>,
    /// Report downloads at a path that was never written
    lose_downloads: bool,
}

struct RecordingTransfer {
    inner: ObjectStoreTransfer,
    faults: Faults,
    uploads: AtomicUsize,
    extracted: Mutex<Vec<String>>,
}

#[async_trait]
impl BulkTransfer for RecordingTransfer {
    async fn bulk_extract(
        &self,
        query: &Query,
        format: &OutputFormat,
        remote: &str,
    ) -> Result<Vec<String>> {
        self.extracted.lock().unwrap().push(remote.to_string());
        self.inner.bulk_extract(query, format, remote).await
    }

    async fn download(&self, remote: &str, local_dir: &Path) -> Result<PathBuf> {
        let local = self.inner.download(remote, local_dir).await?;
        if self.faults.lose_downloads {
            std::fs::remove_file(&local).unwrap();
        }
        Ok(local)
    }

    async fn upload(&self, local: &Path, remote: &str, overwrite: bool) -> Result<()> {
        let call = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_upload_at == Some(call) {
            return Err(ExportError::upload(remote, "connection reset by peer"));
        }
        self.inner.upload(local, remote, overwrite).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(path).await
    }

    async fn probe(&self, prefix: &str) -> Result<()> {
        self.inner.probe(prefix).await
    }
}

/// Rejects every write.
struct UnavailableAudit;

#[async_trait]
impl AuditRepository for UnavailableAudit {
    async fn save_key_selection(
        &self,
        _result: &KeySelectionResult,
        _policy: PersistPolicy,
    ) -> Result<()> {
        Err(ExportError::Internal("audit store offline".to_string()))
    }

    async fn key_selections(&self, _table: &TableRef) -> Result<Vec<KeySelectionResult>> {
        Ok(Vec::new())
    }

    async fn save_run(&self, _record: &RunAuditRecord) -> Result<()> {
        Err(ExportError::Internal("audit store offline".to_string()))
    }

    async fn runs(&self) -> Result<Vec<RunAuditRecord>> {
        Ok(Vec::new())
    }
}

struct UnreachableNotifier;

#[async_trait]
impl Notifier for UnreachableNotifier {
    async fn notify(&self, recipient: &str, _subject: &str, _body: &str) -> Result<()> {
        Err(ExportError::Notification(format!("mail relay refused {recipient}")))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Notification {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

struct Harness {
    store: Arc<DataFusionStore>,
    transfer: Arc<RecordingTransfer>,
    audit: Arc<InMemoryAuditRepository>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    async fn new(rows: usize) -> Self {
        Self::with_faults(rows, Faults::default()).await
    }

    async fn with_faults(rows: usize, faults: Faults) -> Self {
        let store = Arc::new(DataFusionStore::from_context(
            create_unique_pair_context(rows).await.unwrap(),
        ));
        let transfer = Arc::new(RecordingTransfer {
            inner: ObjectStoreTransfer::new(Arc::new(InMemory::new()), store.clone()),
            faults,
            uploads: AtomicUsize::new(0),
            extracted: Mutex::new(Vec::new()),
        });
        Self {
            store,
            transfer,
            audit: Arc::new(InMemoryAuditRepository::new()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            executor: self.store.clone(),
            transfer: self.transfer.clone(),
            audit: self.audit.clone(),
            notifier: self.notifier.clone(),
        }
    }

    async fn run(&self, config: ExportConfig) -> RunOutcome {
        PipelineOrchestrator::new(config, self.deps()).run().await
    }

    async fn fetch(&self, remote: &str, dir: &Path) -> PathBuf {
        self.transfer.download(remote, dir).await.unwrap()
    }
}

fn inline(key: &RecipientKey) -> KeyLocation {
    KeyLocation::Inline {
        material: key.to_key_file().unwrap(),
    }
}

fn decrypt_to_string(path: &Path, secret: &RecipientSecret) -> String {
    let mut plain = Vec::new();
    Decryptor::decrypt(std::fs::File::open(path).unwrap(), &mut plain, secret).unwrap();
    String::from_utf8(plain).unwrap()
}

#[tokio::test]
async fn test_csv_export_for_two_recipients() {
    let harness = Harness::new(30).await;
    let (ops_secret, ops_key) = recipient_pair("ops@example.com").unwrap();
    let (audit_secret, audit_key) = recipient_pair("audit@example.com").unwrap();
    let table = TableRef::bare("accounts");

    let selection = KeyColumnSelector::new(harness.store.clone(), harness.audit.clone())
        .select_key(&table, 1.0, 0.9999)
        .await
        .unwrap();
    assert_eq!(selection.selected_columns.len(), 2);

    let config = ExportConfig::new(table.clone(), "accounts")
        .with_recipient(inline(&ops_key))
        .with_recipient(inline(&audit_key))
        .with_fingerprint_columns(selection.selected_columns.clone())
        .with_shard_count(ShardCount::Fixed(3))
        .with_shard_counts(true)
        .with_notify("data-team@example.com");

    let outcome = harness.run(config).await;
    let summary = match &outcome {
        RunOutcome::Succeeded(summary) => summary,
        RunOutcome::Failed(failure) => panic!("export failed: {} in {}", failure.error, failure.phase),
    };

    assert_eq!(summary.n_shards, 3);
    assert_eq!(summary.total_rows, 30);
    assert_eq!(summary.rows_exported, 30);
    assert_eq!(summary.files.len(), 3);
    assert!(summary.files.iter().all(|f| f.starts_with("output/accounts_")));
    assert!(summary.files.iter().all(|f| f.ends_with(".csv.pgp")));
    assert_eq!(
        summary.recipients,
        vec!["ops@example.com".to_string(), "audit@example.com".to_string()]
    );

    let manifest_path = summary.manifest.clone().unwrap();
    assert!(manifest_path.ends_with(".tag"));
    let output = harness.transfer.list("output").await.unwrap();
    assert_eq!(output.len(), 4);
    assert!(harness.transfer.list("stage").await.unwrap().is_empty());

    let dir = tempfile::tempdir().unwrap();
    let manifest_text =
        std::fs::read_to_string(harness.fetch(&manifest_path, dir.path()).await).unwrap();
    let entries = ManifestBuilder::parse(&manifest_text).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().map(|e| e.row_count).sum::<u64>(), 30);

    for entry in &entries {
        let remote = format!("output/{}", entry.file_name);
        assert!(summary.files.contains(&remote));
        let local = harness.fetch(&remote, dir.path()).await;

        let as_ops = decrypt_to_string(&local, &ops_secret);
        let as_audit = decrypt_to_string(&local, &audit_secret);
        assert_eq!(as_ops, as_audit);

        let mut lines = as_ops.lines();
        assert_eq!(lines.next(), Some("region,seq,status,note"));
        assert_eq!(lines.count() as u64, entry.row_count);
    }

    let runs = harness.audit.runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);
    assert_eq!(runs[0].files_processed, 3);
    assert_eq!(runs[0].total_rows, 30);

    let sent = harness.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "data-team@example.com");
    assert_eq!(sent[0].subject, "Export succeeded: accounts");
}

#[tokio::test]
async fn test_concurrent_shards_export_every_row_once() {
    let harness = Harness::new(64).await;
    let (secret, key) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(&key))
        .with_shard_count(ShardCount::Fixed(4))
        .with_max_concurrent_shards(4)
        .with_header(false)
        .with_delimiter("|");

    let summary = harness.run(config).await.into_result().unwrap();
    assert_eq!(summary.files.len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let mut rows = Vec::new();
    for remote in &summary.files {
        let local = harness.fetch(remote, dir.path()).await;
        rows.extend(
            decrypt_to_string(&local, &secret)
                .lines()
                .map(str::to_string),
        );
    }
    rows.sort();
    rows.dedup();
    assert_eq!(rows.len(), 64);
    assert!(rows.iter().all(|r| r.split('|').count() == 4));
}

#[tokio::test]
async fn test_bad_recipient_key_fails_before_any_upload() {
    let harness = Harness::new(30).await;
    let (_, good) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(&good))
        .with_recipient(KeyLocation::Inline {
            material: "{\"algorithm\": \"x25519\"}".to_string(),
        })
        .with_shard_count(ShardCount::Fixed(3))
        .with_notify("data-team@example.com");

    let outcome = harness.run(config).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::KeySetup);
    assert_eq!(failure.error_kind(), "KeyImportError");
    assert!(failure.files.is_empty());
    assert_eq!(harness.transfer.uploads.load(Ordering::SeqCst), 0);
    assert!(harness.transfer.list("output").await.unwrap().is_empty());

    let runs = harness.audit.runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].failed_phase.as_deref(), Some("key_setup"));
    assert_eq!(runs[0].error_kind.as_deref(), Some("KeyImportError"));

    let sent = harness.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Export failed: accounts");
    assert!(sent[0].body.contains("KeyImportError"));
}

#[tokio::test]
async fn test_unsupported_format_fails_while_analyzing() {
    let harness = Harness::new(10).await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(&key))
        .with_format("xlsx");

    let outcome = harness.run(config).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::Analyzing);
    assert_eq!(failure.error_kind(), "UnsupportedFormatError");
    assert_eq!(harness.transfer.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_table_fails_validation() {
    let harness = Harness::new(10).await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("nowhere"), "nowhere").with_recipient(inline(&key));

    let outcome = harness.run(config).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::Validating);
    assert_eq!(failure.error_kind(), "AccessError");
    assert!(failure.recipients.is_empty());
    assert_eq!(harness.audit.runs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_parquet_export_has_no_manifest() {
    let harness = Harness::new(40).await;
    let (secret, key) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(&key))
        .with_format("parquet")
        .with_shard_count(ShardCount::Fixed(2));

    let summary = harness.run(config).await.into_result().unwrap();
    assert!(summary.manifest.is_none());
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.rows_exported, 40);
    assert_eq!(harness.transfer.list("output").await.unwrap().len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let mut rows = 0;
    for (i, remote) in summary.files.iter().enumerate() {
        assert!(remote.ends_with(".parquet.pgp"));
        let local = harness.fetch(remote, dir.path()).await;
        let plain = dir.path().join(format!("shard_{i}.parquet"));
        Decryptor::decrypt_file(&local, &plain, &secret).await.unwrap();
        let reader = SerializedFileReader::new(std::fs::File::open(&plain).unwrap()).unwrap();
        rows += reader.metadata().file_metadata().num_rows();
    }
    assert_eq!(rows, 40);
}

#[tokio::test]
async fn test_empty_table_exports_header_only_files() {
    let harness = Harness::new(0).await;
    let (secret, key) = recipient_pair("ops@example.com").unwrap();

    let config = ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(&key))
        .with_shard_count(ShardCount::Fixed(2));

    let summary = harness.run(config).await.into_result().unwrap();
    assert_eq!(summary.total_rows, 0);
    assert_eq!(summary.files.len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let manifest = summary.manifest.clone().unwrap();
    let text = std::fs::read_to_string(harness.fetch(&manifest, dir.path()).await).unwrap();
    let entries = ManifestBuilder::parse(&text).unwrap();
    assert!(entries.iter().all(|e| e.row_count == 0));

    let local = harness.fetch(&summary.files[0], dir.path()).await;
    assert_eq!(decrypt_to_string(&local, &secret), "region,seq,status,note\n");
}

fn three_shard_config(key: &RecipientKey) -> ExportConfig {
    ExportConfig::new(TableRef::bare("accounts"), "accounts")
        .with_recipient(inline(key))
        .with_shard_count(ShardCount::Fixed(3))
        .with_max_concurrent_shards(1)
        .with_notify("data-team@example.com")
}

#[tokio::test]
async fn test_low_order_recipient_key_fails_in_key_setup() {
    let harness = Harness::new(30).await;
    let (_, good) = recipient_pair("ops@example.com").unwrap();
    let mut low_order = [0u8; 32];
    low_order[0] = 1;
    let material = format!(
        r#"{{"emails": ["weak@example.com"], "public_key": "{}"}}"#,
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, low_order)
    );

    let config = three_shard_config(&good).with_recipient(KeyLocation::Inline { material });
    let outcome = harness.run(config).await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::KeySetup);
    assert_eq!(failure.error_kind(), "KeyImportError");
    assert!(harness.transfer.extracted.lock().unwrap().is_empty());
    assert_eq!(harness.transfer.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upload_failure_aborts_remaining_shards() {
    let harness = Harness::with_faults(
        30,
        Faults {
            fail_upload_at: Some(1),
            ..Faults::default()
        },
    )
    .await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();

    let outcome = harness.run(three_shard_config(&key)).await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::Shard(1));
    assert_eq!(failure.error_kind(), "UploadError");
    assert!(failure.error.to_string().contains("connection reset by peer"));
    assert_eq!(failure.files.len(), 1);
    assert!(failure.files[0].ends_with("_000.csv.pgp"));

    let extracted = harness.transfer.extracted.lock().unwrap().clone();
    assert_eq!(extracted.len(), 2);
    assert!(!extracted.iter().any(|remote| remote.contains("_002.")));
    assert!(harness.transfer.list("stage").await.unwrap().is_empty());
    assert_eq!(harness.transfer.list("output").await.unwrap().len(), 1);

    let runs = harness.audit.runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].failed_phase.as_deref(), Some("shard_001"));
    assert_eq!(runs[0].error_kind.as_deref(), Some("UploadError"));
    assert_eq!(runs[0].files_processed, 1);

    let sent = harness.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Export failed: accounts");
    assert!(sent[0].body.contains("shard_001"));
}

#[tokio::test]
async fn test_teardown_failures_never_replace_the_run_error() {
    let harness = Harness::with_faults(
        30,
        Faults {
            fail_upload_at: Some(1),
            ..Faults::default()
        },
    )
    .await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();
    let deps = PipelineDeps {
        audit: Arc::new(UnavailableAudit),
        notifier: Arc::new(UnreachableNotifier),
        ..harness.deps()
    };

    let outcome = PipelineOrchestrator::new(three_shard_config(&key), deps)
        .run()
        .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::Shard(1));
    assert_eq!(failure.error_kind(), "UploadError");
    assert!(harness.transfer.list("stage").await.unwrap().is_empty());

    let warnings: Vec<&str> = failure
        .log
        .iter()
        .filter(|entry| entry.level == LogLevel::Warn)
        .map(|entry| entry.message.as_str())
        .collect();
    let audit_at = warnings
        .iter()
        .position(|m| m.starts_with("Audit write failed"))
        .unwrap();
    let notify_at = warnings
        .iter()
        .position(|m| m.starts_with("Notification to data-team@example.com failed"))
        .unwrap();
    assert!(audit_at < notify_at);
}

#[tokio::test]
async fn test_teardown_failures_keep_a_successful_run() {
    let harness = Harness::new(12).await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();
    let deps = PipelineDeps {
        audit: Arc::new(UnavailableAudit),
        notifier: Arc::new(UnreachableNotifier),
        ..harness.deps()
    };

    let outcome = PipelineOrchestrator::new(three_shard_config(&key), deps)
        .run()
        .await;

    let summary = outcome.summary().unwrap();
    assert_eq!(summary.files.len(), 3);
    assert_eq!(summary.rows_exported, 12);
}

#[tokio::test]
async fn test_unreadable_local_copy_is_a_download_error() {
    let harness = Harness::with_faults(
        10,
        Faults {
            lose_downloads: true,
            ..Faults::default()
        },
    )
    .await;
    let (_, key) = recipient_pair("ops@example.com").unwrap();

    let outcome = harness.run(three_shard_config(&key)).await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.phase, Phase::Shard(0));
    assert_eq!(failure.error_kind(), "DownloadError");
    assert_eq!(harness.transfer.uploads.load(Ordering::SeqCst), 0);
    assert!(harness.transfer.list("stage").await.unwrap().is_empty());
}
