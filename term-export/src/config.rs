//! Run configuration for key discovery and export.
//!
//! Both configurations deserialize from JSON and carry builder helpers for
//! programmatic use. `validate()` checks everything that can be checked
//! without touching the data store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::security::{InputValidator, SqlSecurity};
use crate::store::TableRef;

/// Default fraction of rows sampled for column profiling.
pub const DEFAULT_SAMPLE_FRACTION: f64 = 0.02;

/// Default uniqueness ratio at which key selection stops.
pub const DEFAULT_UNIQUENESS_THRESHOLD: f64 = 0.9999;

/// Tables with at most this many rows are profiled in full.
pub const DEFAULT_MIN_SAMPLE_ROWS: u64 = 10_000;

/// Default suffix appended to encrypted file names.
pub const DEFAULT_ENCRYPTED_SUFFIX: &str = "pgp";

/// How a new key-selection record treats earlier records for the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Replace earlier records for the table.
    #[default]
    Overwrite,
    /// Keep earlier records and add the new one.
    Append,
}

/// Configuration for [`crate::selector::KeyColumnSelector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDiscoveryConfig {
    pub sample_fraction: f64,
    pub uniqueness_threshold: f64,
    pub min_sample_rows: u64,
    pub persist_policy: PersistPolicy,
}

impl Default for KeyDiscoveryConfig {
    fn default() -> Self {
        Self {
            sample_fraction: DEFAULT_SAMPLE_FRACTION,
            uniqueness_threshold: DEFAULT_UNIQUENESS_THRESHOLD,
            min_sample_rows: DEFAULT_MIN_SAMPLE_ROWS,
            persist_policy: PersistPolicy::Overwrite,
        }
    }
}

impl KeyDiscoveryConfig {
    pub fn with_sample_fraction(mut self, fraction: f64) -> Self {
        self.sample_fraction = fraction;
        self
    }

    pub fn with_uniqueness_threshold(mut self, threshold: f64) -> Self {
        self.uniqueness_threshold = threshold;
        self
    }

    pub fn with_min_sample_rows(mut self, rows: u64) -> Self {
        self.min_sample_rows = rows;
        self
    }

    pub fn with_persist_policy(mut self, policy: PersistPolicy) -> Self {
        self.persist_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        InputValidator::validate_fraction(self.sample_fraction, "sample_fraction")?;
        InputValidator::validate_fraction(self.uniqueness_threshold, "uniqueness_threshold")?;
        Ok(())
    }
}

/// Sizing heuristic for the shard count.
///
/// `n = clamp(ceil(total_rows / target_rows_per_shard), min_shards, max_shards)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSizing {
    pub target_rows_per_shard: u64,
    pub min_shards: u32,
    pub max_shards: u32,
}

impl Default for ShardSizing {
    fn default() -> Self {
        Self {
            target_rows_per_shard: 1_000_000,
            min_shards: 1,
            max_shards: 256,
        }
    }
}

impl ShardSizing {
    /// Applies the heuristic to a row count.
    pub fn shards_for(&self, total_rows: u64) -> u32 {
        let wanted = total_rows.div_ceil(self.target_rows_per_shard.max(1));
        let wanted = u32::try_from(wanted).unwrap_or(u32::MAX);
        wanted.clamp(self.min_shards.max(1), self.max_shards.max(self.min_shards.max(1)))
    }
}

/// Shard count: a fixed number or derived from the table size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardCount {
    Fixed(u32),
    Auto(ShardSizing),
}

impl Default for ShardCount {
    fn default() -> Self {
        Self::Auto(ShardSizing::default())
    }
}

impl ShardCount {
    /// Resolves the shard count for a table of `total_rows` rows.
    pub fn resolve(&self, total_rows: u64) -> u32 {
        match self {
            Self::Fixed(n) => *n,
            Self::Auto(sizing) => sizing.shards_for(total_rows),
        }
    }
}

/// Where a recipient's public key file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum KeyLocation {
    /// A file in the transfer store, downloaded into a scoped directory.
    Remote { path: String },
    /// A file on the local filesystem.
    Local { path: PathBuf },
    /// Key file contents given inline.
    Inline { material: String },
}

impl KeyLocation {
    /// A short label for logs and errors. Inline material is never echoed.
    pub fn label(&self) -> String {
        match self {
            Self::Remote { path } => path.clone(),
            Self::Local { path } => path.display().to_string(),
            Self::Inline { .. } => "<inline>".to_string(),
        }
    }
}

/// Configuration for one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Source table
    pub table: TableRef,
    /// `csv` or `parquet`
    #[serde(default = "default_format")]
    pub output_format: String,
    /// Field delimiter for delimited text, one character
    #[serde(default)]
    pub delimiter: Option<String>,
    /// Whether delimited text starts with a header line
    #[serde(default)]
    pub include_header: Option<bool>,
    /// Prefix of every output and manifest file name
    pub file_prefix: String,
    /// Transfer-store prefix used for staging extracted files
    pub stage_prefix: String,
    /// Transfer-store prefix receiving encrypted files and the manifest
    pub output_prefix: String,
    /// Recipients; every one must import for the run to proceed
    pub recipient_keys: Vec<KeyLocation>,
    /// Columns hashed for sharding, empty means every column in table order
    #[serde(default)]
    pub fingerprint_columns: Vec<String>,
    #[serde(default)]
    pub shard_count: ShardCount,
    /// Shards processed concurrently, 1 runs them in order
    #[serde(default = "default_concurrency")]
    pub max_concurrent_shards: usize,
    /// ASCII-armor the ciphertext
    #[serde(default)]
    pub armor: bool,
    #[serde(default = "default_suffix")]
    pub encrypted_suffix: String,
    /// Notified once when the run ends
    #[serde(default)]
    pub notify_recipients: Vec<String>,
    /// Collect per-shard row counts while planning
    #[serde(default)]
    pub collect_shard_counts: bool,
    /// Replace existing output files of the same name
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_format() -> String {
    "csv".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_suffix() -> String {
    DEFAULT_ENCRYPTED_SUFFIX.to_string()
}

fn default_overwrite() -> bool {
    true
}

impl ExportConfig {
    /// Creates a CSV export of `table` with default settings.
    pub fn new(table: TableRef, file_prefix: impl Into<String>) -> Self {
        Self {
            table,
            output_format: default_format(),
            delimiter: None,
            include_header: None,
            file_prefix: file_prefix.into(),
            stage_prefix: "stage".to_string(),
            output_prefix: "output".to_string(),
            recipient_keys: Vec::new(),
            fingerprint_columns: Vec::new(),
            shard_count: ShardCount::default(),
            max_concurrent_shards: default_concurrency(),
            armor: false,
            encrypted_suffix: default_suffix(),
            notify_recipients: Vec::new(),
            collect_shard_counts: false,
            overwrite: default_overwrite(),
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn with_header(mut self, include: bool) -> Self {
        self.include_header = Some(include);
        self
    }

    pub fn with_locations(mut self, stage: impl Into<String>, output: impl Into<String>) -> Self {
        self.stage_prefix = stage.into();
        self.output_prefix = output.into();
        self
    }

    pub fn with_recipient(mut self, key: KeyLocation) -> Self {
        self.recipient_keys.push(key);
        self
    }

    pub fn with_fingerprint_columns(mut self, columns: Vec<String>) -> Self {
        self.fingerprint_columns = columns;
        self
    }

    pub fn with_shard_count(mut self, shard_count: ShardCount) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_max_concurrent_shards(mut self, n: usize) -> Self {
        self.max_concurrent_shards = n;
        self
    }

    pub fn with_armor(mut self, armor: bool) -> Self {
        self.armor = armor;
        self
    }

    pub fn with_notify(mut self, recipient: impl Into<String>) -> Self {
        self.notify_recipients.push(recipient.into());
        self
    }

    pub fn with_shard_counts(mut self, collect: bool) -> Self {
        self.collect_shard_counts = collect;
        self
    }

    /// Checks the configuration without touching any collaborator.
    ///
    /// The output format is deliberately not checked here: an unsupported
    /// format surfaces as `UnsupportedFormat` while analyzing the run.
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;

        if self.file_prefix.is_empty()
            || !self
                .file_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ExportError::Configuration(format!(
                "file prefix '{}' must be non-empty and contain only letters, digits, '_', '-' or '.'",
                self.file_prefix
            )));
        }

        for (name, prefix) in [("stage", &self.stage_prefix), ("output", &self.output_prefix)] {
            if prefix.trim_matches('/').is_empty() {
                return Err(ExportError::Configuration(format!(
                    "{name} prefix cannot be empty"
                )));
            }
        }
        if self.stage_prefix.trim_matches('/') == self.output_prefix.trim_matches('/') {
            return Err(ExportError::Configuration(
                "stage and output prefixes must differ".to_string(),
            ));
        }

        if self.recipient_keys.is_empty() {
            return Err(ExportError::Configuration(
                "at least one recipient key is required".to_string(),
            ));
        }

        for column in &self.fingerprint_columns {
            SqlSecurity::validate_identifier(column)?;
        }

        if let ShardCount::Fixed(0) = self.shard_count {
            return Err(ExportError::Configuration(
                "shard count must be at least 1".to_string(),
            ));
        }

        if self.max_concurrent_shards == 0 {
            return Err(ExportError::Configuration(
                "max_concurrent_shards must be at least 1".to_string(),
            ));
        }

        if self.encrypted_suffix.is_empty()
            || !self.encrypted_suffix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ExportError::Configuration(format!(
                "encrypted suffix '{}' must be alphanumeric",
                self.encrypted_suffix
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExportConfig {
        ExportConfig::new(TableRef::bare("orders"), "orders").with_recipient(KeyLocation::Inline {
            material: "{}".to_string(),
        })
    }

    #[test]
    fn test_shard_sizing_heuristic() {
        let sizing = ShardSizing::default();
        assert_eq!(sizing.shards_for(0), 1);
        assert_eq!(sizing.shards_for(1), 1);
        assert_eq!(sizing.shards_for(1_000_000), 1);
        assert_eq!(sizing.shards_for(1_000_001), 2);
        assert_eq!(sizing.shards_for(10_000_000_000), 256);

        let small = ShardSizing {
            target_rows_per_shard: 10,
            min_shards: 3,
            max_shards: 8,
        };
        assert_eq!(small.shards_for(5), 3);
        assert_eq!(small.shards_for(55), 6);
        assert_eq!(ShardCount::Fixed(3).resolve(1_000_000_000), 3);
    }

    #[test]
    fn test_export_config_json_defaults() {
        let json = r#"{
            "table": {"schema": "public", "table": "orders"},
            "file_prefix": "orders",
            "stage_prefix": "stage",
            "output_prefix": "out",
            "recipient_keys": [{"source": "remote", "path": "keys/a.pub"}],
            "shard_count": {"fixed": 3}
        }"#;
        let config: ExportConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.output_format, "csv");
        assert_eq!(config.encrypted_suffix, "pgp");
        assert_eq!(config.max_concurrent_shards, 1);
        assert_eq!(config.shard_count, ShardCount::Fixed(3));
        assert!(config.overwrite);
        assert!(!config.armor);
        config.validate().unwrap();
    }

    #[test]
    fn test_export_config_validation() {
        assert!(valid().validate().is_ok());

        let mut no_keys = valid();
        no_keys.recipient_keys.clear();
        assert!(no_keys.validate().is_err());

        assert!(valid().with_shard_count(ShardCount::Fixed(0)).validate().is_err());
        assert!(valid().with_max_concurrent_shards(0).validate().is_err());
        assert!(valid().with_locations("same", "same/").validate().is_err());

        let mut bad_prefix = valid();
        bad_prefix.file_prefix = "../escape".to_string();
        assert!(bad_prefix.validate().is_err());

        // Unsupported formats are reported later, while analyzing the run
        assert!(valid().with_format("xml").validate().is_ok());
    }

    #[test]
    fn test_key_discovery_defaults() {
        let config = KeyDiscoveryConfig::default();
        assert_eq!(config.sample_fraction, 0.02);
        assert_eq!(config.uniqueness_threshold, 0.9999);
        assert_eq!(config.persist_policy, PersistPolicy::Overwrite);
        assert!(config.validate().is_ok());
        assert!(config.with_uniqueness_threshold(0.0).validate().is_err());
    }
}
